//! 数值工具 - 求解器共用的小型纯函数
//!
//! 这些函数对数值退化很敏感（符号歧义、零角度、万向锁、±π 跳变），
//! 因此单独放在这里并独立测试，不依赖任何求解器状态。

use glam::{Mat3, Mat4, Quat, Vec3};
use std::f32::consts::PI;

const TAU: f32 = 2.0 * PI;

/// 超过此绝对值的 IK 角度视为角度制（略大于一整圈）
pub const DEGREE_DETECT_THRESHOLD: f32 = TAU + 0.1;

// ============================================================================
// 四元数
// ============================================================================

/// 分数幂四元数 q^t
///
/// 先取最短弧（w >= 0），再按轴角缩放。t 可以为负或大于 1。
/// 近零角度时退化为线性近似，避免除以 sin(θ/2)。
pub fn quat_pow(q: Quat, t: f32) -> Quat {
    if !q.is_finite() || !t.is_finite() {
        return Quat::IDENTITY;
    }
    let q = if q.w < 0.0 { -q } else { q };
    let q = q.normalize();
    let v = Vec3::new(q.x, q.y, q.z);
    let s = v.length();
    if s < 1.0e-6 {
        let r = Quat::from_xyzw(v.x * t, v.y * t, v.z * t, 1.0);
        return r.normalize();
    }
    let half = s.atan2(q.w);
    Quat::from_axis_angle(v / s, 2.0 * half * t)
}

/// 四元数绕指定轴的扭转角（swing-twist 分解），范围 (-π, π]
///
/// q 与 -q 表示同一旋转，结果经过 wrap 后两者一致。
pub fn twist_angle(q: Quat, axis: Vec3) -> f32 {
    let axis = axis.normalize_or_zero();
    if axis == Vec3::ZERO {
        return 0.0;
    }
    let p = Vec3::new(q.x, q.y, q.z).dot(axis);
    wrap_pi(2.0 * p.atan2(q.w))
}

/// 旋转向量（轴 * 角度，取最短弧）
pub fn rotation_vector(q: Quat) -> Vec3 {
    let q = if q.w < 0.0 { -q } else { q };
    let v = Vec3::new(q.x, q.y, q.z);
    let s = v.length();
    if s < 1.0e-8 {
        return v * 2.0;
    }
    let angle = 2.0 * s.atan2(q.w);
    v / s * angle
}

/// 由旋转向量构造四元数
pub fn quat_from_rotation_vector(v: Vec3) -> Quat {
    let angle = v.length();
    if angle < 1.0e-8 {
        return Quat::from_xyzw(v.x * 0.5, v.y * 0.5, v.z * 0.5, 1.0).normalize();
    }
    Quat::from_axis_angle(v / angle, angle)
}

/// 半隐式旋转积分：q' = normalize(q + h/2 * ω ⊗ q)
pub fn integrate_rotation(q: Quat, omega: Vec3, h: f32) -> Quat {
    let w = Quat::from_xyzw(omega.x, omega.y, omega.z, 0.0);
    let dq = w * q * (0.5 * h);
    (q + dq).normalize()
}

// ============================================================================
// 角度
// ============================================================================

/// 角度归一化到 (-π, π]
pub fn wrap_pi(angle: f32) -> f32 {
    let mut r = angle % TAU;
    if r <= -PI {
        r += TAU;
    } else if r > PI {
        r -= TAU;
    }
    r
}

/// 把角度展开到最接近 reference 的等价值（相差 2πk）
///
/// 以上一帧的解为参考展开，避免在 ±π 处跳变。
pub fn unwrap_angle(angle: f32, reference: f32) -> f32 {
    if !angle.is_finite() || !reference.is_finite() {
        return angle;
    }
    reference + wrap_pi(angle - reference)
}

/// 投影到与 axis 正交的平面后，from → to 的有符号夹角
///
/// 任一投影长度接近零时返回 None。
pub fn signed_angle_in_plane(from: Vec3, to: Vec3, axis: Vec3) -> Option<f32> {
    let axis = axis.normalize_or_zero();
    if axis == Vec3::ZERO {
        return None;
    }
    let a = from - axis * from.dot(axis);
    let b = to - axis * to.dot(axis);
    if a.length_squared() < 1.0e-10 || b.length_squared() < 1.0e-10 {
        return None;
    }
    let a = a.normalize();
    let b = b.normalize();
    let angle = axis.dot(a.cross(b)).atan2(a.dot(b));
    angle.is_finite().then_some(angle)
}

/// 判断一组原始角度是否像角度制
pub fn looks_like_degrees<I: IntoIterator<Item = f32>>(values: I) -> bool {
    values
        .into_iter()
        .any(|v| v.is_finite() && v.abs() > DEGREE_DETECT_THRESHOLD)
}

// ============================================================================
// 欧拉角（X → Y → Z 依次施加，即 R = Rz * Ry * Rx）
// ============================================================================

/// 由欧拉角合成旋转
#[inline]
pub fn compose_euler_xyz(e: Vec3) -> Quat {
    Quat::from_rotation_z(e.z) * Quat::from_rotation_y(e.y) * Quat::from_rotation_x(e.x)
}

/// 分解欧拉角，并在多个等价解中选择最接近 prev 的一个
pub fn decompose_euler_xyz(q: Quat, prev: Vec3) -> Vec3 {
    let m = Mat3::from_quat(q.normalize());
    let sy = (-m.col(0).z).clamp(-1.0, 1.0);

    let result = if 1.0 - sy.abs() < 1.0e-6 {
        // 万向锁：只有 x 与 z 的组合可确定，把自由度全部放到 z
        let ry = sy.asin();
        let rz = (-m.col(1).x).atan2(m.col(1).y);
        Vec3::new(0.0, ry, rz)
    } else {
        Vec3::new(
            m.col(1).z.atan2(m.col(2).z),
            sy.asin(),
            m.col(0).y.atan2(m.col(0).x),
        )
    };

    find_closest_euler(result, prev)
}

/// 找到最接近 prev 的欧拉角表示
fn find_closest_euler(r: Vec3, prev: Vec3) -> Vec3 {
    let candidates = [
        r,
        Vec3::new(r.x + PI, PI - r.y, r.z + PI),
        Vec3::new(r.x + PI, PI - r.y, r.z - PI),
        Vec3::new(r.x + PI, -PI - r.y, r.z + PI),
        Vec3::new(r.x + PI, -PI - r.y, r.z - PI),
        Vec3::new(r.x - PI, PI - r.y, r.z + PI),
        Vec3::new(r.x - PI, PI - r.y, r.z - PI),
        Vec3::new(r.x - PI, -PI - r.y, r.z + PI),
        Vec3::new(r.x - PI, -PI - r.y, r.z - PI),
    ];

    let mut best = r;
    let mut best_error = euler_error(r, prev);
    for candidate in &candidates[1..] {
        let error = euler_error(*candidate, prev);
        if error < best_error {
            best_error = error;
            best = *candidate;
        }
    }

    // 每个分量再展开到 prev 附近，保证连续
    Vec3::new(
        unwrap_angle(best.x, prev.x),
        unwrap_angle(best.y, prev.y),
        unwrap_angle(best.z, prev.z),
    )
}

fn euler_error(a: Vec3, b: Vec3) -> f32 {
    wrap_pi(a.x - b.x).abs() + wrap_pi(a.y - b.y).abs() + wrap_pi(a.z - b.z).abs()
}

// ============================================================================
// 几何
// ============================================================================

/// 两线段最近点
///
/// 返回 (s, t, c1, c2)：c1 = p1 + (q1 - p1) * s，c2 = p2 + (q2 - p2) * t
pub fn closest_points_segments(p1: Vec3, q1: Vec3, p2: Vec3, q2: Vec3) -> (f32, f32, Vec3, Vec3) {
    const EPS: f32 = 1.0e-10;
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.dot(d1);
    let e = d2.dot(d2);
    let f = d2.dot(r);

    let (s, t) = if a <= EPS && e <= EPS {
        (0.0, 0.0)
    } else if a <= EPS {
        (0.0, (f / e).clamp(0.0, 1.0))
    } else {
        let c = d1.dot(r);
        if e <= EPS {
            ((-c / a).clamp(0.0, 1.0), 0.0)
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            let mut s = if denom > EPS {
                ((b * f - c * e) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let mut t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
            (s, t)
        }
    };

    (s, t, p1 + d1 * s, p2 + d2 * t)
}

/// 任意与 v 垂直的单位向量
pub fn any_perpendicular(v: Vec3) -> Vec3 {
    let v = v.normalize_or_zero();
    let helper = if v.x.abs() < 0.9 { Vec3::X } else { Vec3::Y };
    let p = v.cross(helper).normalize_or_zero();
    if p == Vec3::ZERO {
        Vec3::Z
    } else {
        p
    }
}

/// 刚体变换（无缩放）分解为平移与旋转，非有限时返回 None
pub fn decompose_rigid(m: &Mat4) -> Option<(Vec3, Quat)> {
    if !m.is_finite() {
        return None;
    }
    let (_, rotation, translation) = m.to_scale_rotation_translation();
    let rotation = rotation.normalize();
    (rotation.is_finite() && translation.is_finite()).then_some((translation, rotation))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quat_close(a: Quat, b: Quat, eps: f32) -> bool {
        a.dot(b).abs() > 1.0 - eps
    }

    #[test]
    fn test_quat_pow_half_and_negative() {
        let q = Quat::from_rotation_y(1.0);
        let half = quat_pow(q, 0.5);
        assert!(quat_close(half, Quat::from_rotation_y(0.5), 1e-6));

        let neg = quat_pow(q, -0.5);
        assert!(quat_close(neg, Quat::from_rotation_y(-0.5), 1e-6));

        let over = quat_pow(q, 1.5);
        assert!(quat_close(over, Quat::from_rotation_y(1.5), 1e-6));
    }

    #[test]
    fn test_quat_pow_sign_ambiguity() {
        // -q 与 q 同一旋转，幂的结果也应相同（取最短弧）
        let q = Quat::from_rotation_x(0.8);
        let a = quat_pow(q, 0.3);
        let b = quat_pow(-q, 0.3);
        assert!(quat_close(a, b, 1e-6));
    }

    #[test]
    fn test_quat_pow_near_identity() {
        let q = Quat::from_rotation_z(1.0e-7);
        let r = quat_pow(q, 0.5);
        assert!(r.is_finite());
        assert!(quat_close(r, Quat::IDENTITY, 1e-6));
    }

    #[test]
    fn test_twist_angle() {
        let q = Quat::from_rotation_x(0.7) * Quat::from_rotation_y(0.0);
        assert!((twist_angle(q, Vec3::X) - 0.7).abs() < 1e-5);
        assert!((twist_angle(-q, Vec3::X) - 0.7).abs() < 1e-5);

        let q = Quat::from_rotation_x(-2.5);
        assert!((twist_angle(q, Vec3::X) + 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_unwrap_angle_near_pi() {
        // 上一帧 3.1，当前提取到 -3.1 -> 应展开为 2π - 3.1
        let unwrapped = unwrap_angle(-3.1, 3.1);
        assert!((unwrapped - (TAU - 3.1)).abs() < 1e-5);

        // 参考值在多圈之外
        let unwrapped = unwrap_angle(0.1, 4.0 * PI);
        assert!((unwrapped - (4.0 * PI + 0.1)).abs() < 1e-4);
    }

    #[test]
    fn test_signed_angle_in_plane() {
        let a = signed_angle_in_plane(Vec3::Y, Vec3::Z, Vec3::X).unwrap();
        assert!((a - PI / 2.0).abs() < 1e-5);
        let b = signed_angle_in_plane(Vec3::Z, Vec3::Y, Vec3::X).unwrap();
        assert!((b + PI / 2.0).abs() < 1e-5);
        // 与轴平行的向量投影后退化
        assert!(signed_angle_in_plane(Vec3::X, Vec3::Y, Vec3::X).is_none());
    }

    #[test]
    fn test_euler_roundtrip() {
        let e = Vec3::new(0.3, -0.4, 1.1);
        let q = compose_euler_xyz(e);
        let d = decompose_euler_xyz(q, Vec3::ZERO);
        assert!((d - e).length() < 1e-4, "{d:?}");
    }

    #[test]
    fn test_euler_gimbal_lock_is_finite() {
        let q = compose_euler_xyz(Vec3::new(0.2, PI / 2.0, 0.5));
        let d = decompose_euler_xyz(q, Vec3::ZERO);
        assert!(d.is_finite());
        assert!(quat_close(compose_euler_xyz(d), q, 1e-4));
    }

    #[test]
    fn test_euler_prefers_prev() {
        let e = Vec3::new(0.0, 0.0, 3.0);
        let q = compose_euler_xyz(e);
        // 参考值在 -π 附近时结果应展开到 -π 附近
        let d = decompose_euler_xyz(q, Vec3::new(0.0, 0.0, -3.2));
        assert!((d.z - (3.0 - TAU)).abs() < 1e-4);
    }

    #[test]
    fn test_looks_like_degrees() {
        assert!(looks_like_degrees([0.0, 90.0]));
        assert!(!looks_like_degrees([0.5, -2.6, PI]));
    }

    #[test]
    fn test_closest_points_segments() {
        let (_, _, c1, c2) = closest_points_segments(
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, -1.0),
            Vec3::new(0.0, 1.0, 1.0),
        );
        assert!((c1 - Vec3::ZERO).length() < 1e-6);
        assert!((c2 - Vec3::Y).length() < 1e-6);

        // 平行线段
        let (_, _, c1, c2) = closest_points_segments(
            Vec3::ZERO,
            Vec3::X,
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(1.0, 2.0, 0.0),
        );
        assert!(((c2 - c1).length() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_rotation_vector_roundtrip() {
        let v = Vec3::new(0.2, -0.5, 0.1);
        let q = quat_from_rotation_vector(v);
        assert!((rotation_vector(q) - v).length() < 1e-5);
    }
}
