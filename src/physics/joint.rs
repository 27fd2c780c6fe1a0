//! 关节约束 - XPBD 风格的 6DOF 弹簧关节
//!
//! 每次迭代先解角度（欧拉角限制 / 弹簧回正），再解锚点位置（位置限制 / 弹簧）。
//! 位置约束使用柔度 α / h²，累计乘子跨子步保留并按衰减系数衰减。
//! 子步末尾再做一次只看限制的角度投影。

use glam::{Mat4, Quat, Vec3};

use crate::math::{compose_euler_xyz, decompose_euler_xyz, rotation_vector};

use super::config::PhysicsConfig;
use super::definition::JointDef;
use super::rigid_body::Body;

/// 运行时关节
#[derive(Debug, Clone)]
pub struct JointConstraint {
    pub name: String,
    pub body_a: usize,
    pub body_b: usize,
    /// 刚体 A 本地空间中的关节坐标系
    pub anchor_a: (Vec3, Quat),
    /// 刚体 B 本地空间中的关节坐标系
    pub anchor_b: (Vec3, Quat),
    pub position_min: Vec3,
    pub position_max: Vec3,
    pub rotation_min: Vec3,
    pub rotation_max: Vec3,
    pub position_spring: Vec3,
    pub rotation_spring: Vec3,
    /// 位置约束累计乘子
    lambda: f32,
    /// 上一次分解出的相对欧拉角（保证连续性）
    last_euler: Vec3,
}

/// 单次迭代的求解参数
#[derive(Clone, Copy, Debug)]
pub(crate) struct JointStep {
    pub h: f32,
    pub last_iteration: bool,
}

impl JointConstraint {
    /// 把关节的世界坐标系转换为两个刚体（绑定变换 `frame_a` / `frame_b`）各自的本地锚点
    pub fn from_def(
        def: &JointDef,
        body_a: usize,
        body_b: usize,
        frame_a: Mat4,
        frame_b: Mat4,
    ) -> Self {
        let (position, rotation) = def.bind_frame();
        let local = |frame: Mat4| {
            let (_, body_rot, body_pos) = frame.to_scale_rotation_translation();
            let inv_rot = body_rot.inverse();
            (
                inv_rot * (position - body_pos),
                (inv_rot * rotation).normalize(),
            )
        };
        Self {
            name: def.name.clone(),
            body_a,
            body_b,
            anchor_a: local(frame_a),
            anchor_b: local(frame_b),
            position_min: def.position_min.min(def.position_max),
            position_max: def.position_min.max(def.position_max),
            rotation_min: def.rotation_min,
            rotation_max: def.rotation_max,
            position_spring: def.position_spring,
            rotation_spring: def.rotation_spring,
            lambda: 0.0,
            last_euler: Vec3::ZERO,
        }
    }

    /// 子步开始时衰减累计冲量
    #[inline]
    pub fn decay(&mut self, factor: f32) {
        self.lambda *= factor;
    }

    pub fn reset(&mut self) {
        self.lambda = 0.0;
        self.last_euler = Vec3::ZERO;
    }

    /// 两个关节坐标系的世界旋转
    #[inline]
    fn frames(&self, a: &Body, b: &Body) -> (Quat, Quat) {
        (
            (a.rotation * self.anchor_a.1).normalize(),
            (b.rotation * self.anchor_b.1).normalize(),
        )
    }

    /// 当前相对旋转的 X/Y/Z 欧拉角
    pub fn relative_euler(&self, a: &Body, b: &Body) -> Vec3 {
        let (qa, qb) = self.frames(a, b);
        decompose_euler_xyz(qa.inverse() * qb, self.last_euler)
    }

    /// 当前相对旋转：(A 坐标系, B 坐标系, 欧拉角)；两侧都不可动或分解失败时为 None
    fn relative(&self, a: &Body, b: &Body) -> Option<(Quat, Quat, Vec3)> {
        if a.effective_inv_mass() + b.effective_inv_mass() <= 0.0 {
            return None;
        }
        let (qa, qb) = self.frames(a, b);
        let euler = decompose_euler_xyz(qa.inverse() * qb, self.last_euler);
        euler.is_finite().then_some((qa, qb, euler))
    }

    /// 按角度限制钳制；下限大于上限表示该轴自由
    fn clamp_to_limits(&self, euler: Vec3) -> (Vec3, bool) {
        let mut target = euler;
        let mut violated = false;
        for i in 0..3 {
            let (lo, hi) = (self.rotation_min[i], self.rotation_max[i]);
            if lo > hi {
                continue;
            }
            if euler[i] < lo {
                target[i] = lo;
                violated = true;
            } else if euler[i] > hi {
                target[i] = hi;
                violated = true;
            }
        }
        (target, violated)
    }

    /// 把相对旋转转到 `corrected`，按逆质量分配给两侧
    fn rotate_to(a: &mut Body, b: &mut Body, qa: Quat, qb: Quat, corrected: Vec3) {
        let wa = a.effective_inv_mass();
        let wb = b.effective_inv_mass();
        let w = wa + wb;
        // qb' = qa * rel'，误差旋转在世界空间表达
        let desired_b = qa * compose_euler_xyz(corrected);
        let error = rotation_vector((desired_b * qb.inverse()).normalize());
        if !error.is_finite() {
            return;
        }
        b.apply_rotation(error * (wb / w));
        a.apply_rotation(-error * (wa / w));
    }

    /// 角度约束
    pub(crate) fn solve_angular(
        &mut self,
        a: &mut Body,
        b: &mut Body,
        step: JointStep,
        config: &PhysicsConfig,
    ) {
        let Some((qa, qb, euler)) = self.relative(a, b) else {
            return;
        };
        let (target, violated) = self.clamp_to_limits(euler);

        let corrected = if violated {
            let fraction = if step.last_iteration { 1.0 } else { config.limit_correction };
            euler + (target - euler) * fraction
        } else {
            // 未超限：按弹簧刚度向 0（或最近的限制内角度）回正
            let mut relaxed = euler;
            for i in 0..3 {
                let (lo, hi) = (self.rotation_min[i], self.rotation_max[i]);
                let rest = if lo > hi { 0.0 } else { 0.0f32.clamp(lo, hi) };
                relaxed[i] += spring_delta(self.rotation_spring[i], rest - euler[i], step.h, config)
                    .clamp(-config.spring_relax_cap, config.spring_relax_cap);
            }
            relaxed
        };

        self.last_euler = corrected;
        if corrected != euler {
            Self::rotate_to(a, b, qa, qb, corrected);
        }
    }

    /// 子步末尾的角度投影：只处理限制，完全拉回，不含弹簧
    pub(crate) fn project_limits(&mut self, a: &mut Body, b: &mut Body) {
        let Some((qa, qb, euler)) = self.relative(a, b) else {
            return;
        };
        let (target, violated) = self.clamp_to_limits(euler);
        self.last_euler = target;
        if violated {
            Self::rotate_to(a, b, qa, qb, target);
        }
    }

    /// 锚点位置约束
    pub(crate) fn solve_position(
        &mut self,
        a: &mut Body,
        b: &mut Body,
        step: JointStep,
        config: &PhysicsConfig,
    ) {
        let ra = a.rotation * self.anchor_a.0;
        let rb = b.rotation * self.anchor_b.0;
        let pa = a.position + ra;
        let pb = b.position + rb;

        // 在 A 的关节坐标系中按位置限制钳制
        let frame_a = (a.rotation * self.anchor_a.1).normalize();
        let d_local = frame_a.inverse() * (pb - pa);
        let mut allowed = d_local.clamp(self.position_min, self.position_max);
        // 限制内的位移由位置弹簧拉向 0（或最近的限制内位置）
        for i in 0..3 {
            let rest = 0.0f32.clamp(self.position_min[i], self.position_max[i]);
            allowed[i] += spring_delta(self.position_spring[i], rest - allowed[i], step.h, config);
        }
        let error = frame_a * (d_local - allowed);

        let c = error.length();
        if !(c > 1.0e-7) {
            return;
        }
        let n = error / c;

        let w = a.generalized_inv_mass(ra, n) + b.generalized_inv_mass(rb, n);
        if w <= 0.0 {
            return;
        }
        let alpha = config.joint_compliance / (step.h * step.h);
        let delta_lambda = (-c - alpha * self.lambda) / (w + alpha);
        if !delta_lambda.is_finite() {
            return;
        }
        self.lambda += delta_lambda;

        let p = n * delta_lambda;
        b.apply_correction(p, rb, config.max_position_correction, config.max_angular_correction);
        a.apply_correction(-p, ra, config.max_position_correction, config.max_angular_correction);
    }

    /// 两侧锚点的距离
    pub(crate) fn anchor_error(&self, a: &Body, b: &Body) -> f32 {
        let pa = a.position + a.rotation * self.anchor_a.0;
        let pb = b.position + b.rotation * self.anchor_b.0;
        (pb - pa).length()
    }
}

/// 弹簧在一个子步内拉回的量：offset * min(k * h², 1)
#[inline]
fn spring_delta(stiffness: f32, offset: f32, h: f32, config: &PhysicsConfig) -> f32 {
    let k = stiffness * config.spring_stiffness_scale;
    if !(k > 0.0) {
        return 0.0;
    }
    offset * (k * h * h).min(1.0)
}

/// 取两个不同刚体的可变引用
pub(crate) fn pair_mut(bodies: &mut [Body], a: usize, b: usize) -> Option<(&mut Body, &mut Body)> {
    if a == b || a >= bodies.len() || b >= bodies.len() {
        return None;
    }
    if a < b {
        let (lo, hi) = bodies.split_at_mut(b);
        Some((&mut lo[a], &mut hi[0]))
    } else {
        let (lo, hi) = bodies.split_at_mut(a);
        Some((&mut hi[0], &mut lo[b]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::definition::{BodyMode, RigidBodyDef, RigidBodyShape};
    use glam::Mat4;

    fn body(mode: BodyMode, position: Vec3) -> Body {
        let size = Vec3::splat(0.5);
        let def = RigidBodyDef::new("b", -1, RigidBodyShape::Sphere, size, position, mode);
        Body::from_def(&def, None, None::<Mat4>, &PhysicsConfig::default())
    }

    #[test]
    fn test_pair_mut_order() {
        let mut bodies = vec![
            body(BodyMode::FollowBone, Vec3::ZERO),
            body(BodyMode::Physics, Vec3::X),
        ];
        let (b, a) = pair_mut(&mut bodies, 1, 0).unwrap();
        assert_eq!(b.position, Vec3::X);
        assert_eq!(a.position, Vec3::ZERO);
        assert!(pair_mut(&mut bodies, 1, 1).is_none());
        assert!(pair_mut(&mut bodies, 0, 5).is_none());
    }

    #[test]
    fn test_angular_limit_full_correction_on_last_iteration() {
        let config = PhysicsConfig::default();
        let mut a = body(BodyMode::FollowBone, Vec3::ZERO);
        let mut b = body(BodyMode::Physics, Vec3::ZERO);
        let def = JointDef::new("j", 0, 1, Vec3::ZERO)
            .with_rotation_limits(Vec3::new(-0.5, 0.0, 0.0), Vec3::new(0.5, 0.0, 0.0));
        let mut joint = JointConstraint::from_def(&def, 0, 1, a.transform(), b.transform());

        b.rotation = Quat::from_rotation_x(2.0);
        let step = JointStep { h: 1.0 / 120.0, last_iteration: true };
        joint.solve_angular(&mut a, &mut b, step, &config);

        let euler = joint.relative_euler(&a, &b);
        assert!((euler.x - 0.5).abs() < 1e-3, "{:?}", euler);
        assert_eq!(a.rotation, Quat::IDENTITY);
    }

    #[test]
    fn test_project_limits_ignores_springs() {
        let mut a = body(BodyMode::FollowBone, Vec3::ZERO);
        let mut b = body(BodyMode::Physics, Vec3::ZERO);
        let def = JointDef::new("j", 0, 1, Vec3::ZERO)
            .with_rotation_limits(Vec3::new(-0.5, -1.0, -1.0), Vec3::new(0.5, 1.0, 1.0))
            .with_springs(Vec3::ZERO, Vec3::splat(1000.0));
        let mut joint = JointConstraint::from_def(&def, 0, 1, a.transform(), b.transform());

        b.rotation = Quat::from_rotation_y(0.3);
        joint.project_limits(&mut a, &mut b);
        assert_eq!(b.rotation, Quat::from_rotation_y(0.3));

        b.rotation = Quat::from_rotation_x(-1.5);
        joint.project_limits(&mut a, &mut b);
        let euler = joint.relative_euler(&a, &b);
        assert!((euler.x + 0.5).abs() < 1e-4, "{:?}", euler);
    }

    #[test]
    fn test_position_spring_pulls_within_limits() {
        let config = PhysicsConfig::default();
        let mut a = body(BodyMode::FollowBone, Vec3::ZERO);
        let mut b = body(BodyMode::Physics, Vec3::ZERO);
        let def = JointDef::new("j", 0, 1, Vec3::ZERO)
            .with_position_limits(Vec3::splat(-1.0), Vec3::splat(1.0))
            .with_springs(Vec3::splat(3600.0), Vec3::ZERO);
        let mut joint = JointConstraint::from_def(&def, 0, 1, a.transform(), b.transform());

        // 限制内偏移 0.5：无弹簧时不动，有弹簧时被拉回
        b.position = Vec3::new(0.5, 0.0, 0.0);
        let mut loose = joint.clone();
        loose.position_spring = Vec3::ZERO;
        let mut free_b = b.clone();
        let step = JointStep { h: 1.0 / 120.0, last_iteration: false };
        loose.solve_position(&mut a, &mut free_b, step, &config);
        assert_eq!(free_b.position, b.position);

        for _ in 0..8 {
            joint.solve_position(&mut a, &mut b, step, &config);
        }
        assert!(b.position.x < 0.4, "{:?}", b.position);
        assert!(b.position.x > 0.0);
    }

    #[test]
    fn test_position_constraint_pulls_anchor_together() {
        let config = PhysicsConfig::default();
        let mut a = body(BodyMode::FollowBone, Vec3::ZERO);
        let mut b = body(BodyMode::Physics, Vec3::new(0.0, 0.0, -1.0));
        let def = JointDef::new("j", 0, 1, Vec3::ZERO);
        let mut joint = JointConstraint::from_def(&def, 0, 1, a.transform(), b.transform());

        b.position += Vec3::new(0.0, -0.2, 0.0);
        let before = joint.anchor_error(&a, &b);
        let step = JointStep { h: 1.0 / 120.0, last_iteration: false };
        for _ in 0..8 {
            joint.solve_position(&mut a, &mut b, step, &config);
        }
        assert!(joint.anchor_error(&a, &b) < before * 0.1);
        assert_eq!(a.position, Vec3::ZERO);
    }
}
