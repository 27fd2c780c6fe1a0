//! 碰撞检测与求解
//!
//! 粗检测：沿 X 轴的扫描剪枝（插入排序，帧间顺序基本稳定）。
//! 细检测：胶囊-胶囊（线段最近点）、胶囊-长方体（线段采样）、
//! 长方体-长方体（分离轴）。穿透用与关节相同的柔度位置修正，
//! 再按库仑摩擦做切向修正。

use glam::Vec3;

use crate::math::closest_points_segments;

use super::config::{GroupMaskSemantics, PhysicsConfig};
use super::definition::RigidBodyShape;
use super::rigid_body::{unit_axis, Body};

/// 胶囊-长方体检测时线段的采样数
const CAPSULE_SAMPLES: usize = 5;

// ============================================================================
// 碰撞组
// ============================================================================

/// 两个刚体的碰撞组是否允许碰撞
pub fn groups_collide(
    semantics: GroupMaskSemantics,
    group_a: u8,
    mask_a: u16,
    group_b: u8,
    mask_b: u16,
) -> bool {
    let bit_a = 1u16 << group_a.min(15);
    let bit_b = 1u16 << group_b.min(15);
    match semantics {
        GroupMaskSemantics::CollideWith => mask_a & bit_b != 0 && mask_b & bit_a != 0,
        GroupMaskSemantics::Ignore => mask_a & bit_b == 0 && mask_b & bit_a == 0,
    }
}

/// 根据掩码统计推断语义：平均置位数超过一半视为"与之碰撞"
///
/// 没有任何掩码时回退为 CollideWith。
pub fn infer_group_semantics<I: IntoIterator<Item = u16>>(masks: I) -> GroupMaskSemantics {
    let (count, bits) = masks
        .into_iter()
        .fold((0u32, 0u32), |(n, bits), m| (n + 1, bits + m.count_ones()));
    if count == 0 {
        return GroupMaskSemantics::CollideWith;
    }
    if bits as f32 / count as f32 > 8.0 {
        GroupMaskSemantics::CollideWith
    } else {
        GroupMaskSemantics::Ignore
    }
}

// ============================================================================
// 粗检测
// ============================================================================

/// 扫描剪枝
#[derive(Debug, Default)]
pub(crate) struct BroadPhase {
    order: Vec<usize>,
    intervals: Vec<(f32, f32)>,
}

impl BroadPhase {
    /// 返回 X 区间重叠的刚体对 (小索引, 大索引)
    pub fn update(&mut self, bodies: &[Body], margin: f32) -> Vec<(usize, usize)> {
        if self.order.len() != bodies.len() {
            self.order = (0..bodies.len()).collect();
        }
        self.intervals.clear();
        self.intervals.extend(bodies.iter().map(|b| {
            let r = b.bounding_radius() + margin;
            (b.position.x - r, b.position.x + r)
        }));

        let intervals = &self.intervals;
        let order = &mut self.order;
        for i in 1..order.len() {
            let mut j = i;
            while j > 0 && intervals[order[j - 1]].0 > intervals[order[j]].0 {
                order.swap(j - 1, j);
                j -= 1;
            }
        }

        let mut pairs = Vec::new();
        for (i, &a) in order.iter().enumerate() {
            let max_a = intervals[a].1;
            for &b in &order[i + 1..] {
                if intervals[b].0 > max_a {
                    break;
                }
                pairs.push((a.min(b), a.max(b)));
            }
        }
        pairs
    }
}

// ============================================================================
// 细检测
// ============================================================================

/// 接触信息（法线从 A 指向 B）
#[derive(Debug, Clone, Copy)]
pub(crate) struct Contact {
    pub normal: Vec3,
    pub depth: f32,
    pub point_a: Vec3,
    pub point_b: Vec3,
}

impl Contact {
    fn flipped(self) -> Self {
        Self {
            normal: -self.normal,
            depth: self.depth,
            point_a: self.point_b,
            point_b: self.point_a,
        }
    }
}

/// 按形状组合分派
pub(crate) fn collide(a: &Body, b: &Body) -> Option<Contact> {
    let contact = match (a.shape == RigidBodyShape::Box, b.shape == RigidBodyShape::Box) {
        (true, true) => box_box(a, b),
        (false, true) => capsule_box(a, b),
        (true, false) => capsule_box(b, a).map(Contact::flipped),
        (false, false) => capsule_capsule(a, b),
    }?;
    (contact.depth.is_finite() && contact.normal.is_finite()).then_some(contact)
}

fn capsule_capsule(a: &Body, b: &Body) -> Option<Contact> {
    let (p1, q1) = a.segment();
    let (p2, q2) = b.segment();
    let (_, _, c1, c2) = closest_points_segments(p1, q1, p2, q2);
    let d = c2 - c1;
    let dist = d.length();
    let depth = a.radius + b.radius - dist;
    if depth <= 0.0 {
        return None;
    }
    let normal = if dist > 1.0e-6 {
        d / dist
    } else {
        (b.position - a.position).try_normalize().unwrap_or(Vec3::Y)
    };
    Some(Contact {
        normal,
        depth,
        point_a: c1 + normal * a.radius,
        point_b: c2 - normal * b.radius,
    })
}

/// 胶囊线段采样点在长方体本地空间中检测，取最深的一个
fn capsule_box(capsule: &Body, cube: &Body) -> Option<Contact> {
    let (p, q) = capsule.segment();
    let inv_rot = cube.rotation.inverse();
    let e = cube.half_extents;

    // (深度, 长方体 → 胶囊的本地法线, 长方体表面点, 采样点)
    let mut best: Option<(f32, Vec3, Vec3, Vec3)> = None;
    for k in 0..CAPSULE_SAMPLES {
        let t = k as f32 / (CAPSULE_SAMPLES - 1) as f32;
        let sample = p.lerp(q, t);
        let local = inv_rot * (sample - cube.position);
        let closest = local.clamp(-e, e);
        let delta = local - closest;
        let dist = delta.length();

        let candidate = if dist > 1.0e-6 {
            let depth = capsule.radius - dist;
            (depth > 0.0).then(|| (depth, delta / dist, closest, sample))
        } else {
            // 采样点在长方体内部：从最近的面推出
            let mut axis = 0;
            let mut face = f32::MAX;
            for i in 0..3 {
                let d = e[i] - local[i].abs();
                if d < face {
                    face = d;
                    axis = i;
                }
            }
            let sign = if local[axis] < 0.0 { -1.0 } else { 1.0 };
            let mut surface = local;
            surface[axis] = sign * e[axis];
            Some((capsule.radius + face, unit_axis(axis) * sign, surface, sample))
        };

        if let Some(c) = candidate {
            if best.map_or(true, |b| c.0 > b.0) {
                best = Some(c);
            }
        }
    }

    let (depth, local_normal, surface, sample) = best?;
    let box_to_capsule = cube.rotation * local_normal;
    Some(Contact {
        normal: -box_to_capsule,
        depth,
        point_a: sample - box_to_capsule * capsule.radius,
        point_b: cube.position + cube.rotation * surface,
    })
}

/// 分离轴检测：3 + 3 个面法线与 9 个边叉积
fn box_box(a: &Body, b: &Body) -> Option<Contact> {
    let axes_a = [a.rotation * Vec3::X, a.rotation * Vec3::Y, a.rotation * Vec3::Z];
    let axes_b = [b.rotation * Vec3::X, b.rotation * Vec3::Y, b.rotation * Vec3::Z];
    let (ea, eb) = (a.half_extents, b.half_extents);
    let d = b.position - a.position;

    let project = |axes: &[Vec3; 3], e: Vec3, l: Vec3| {
        e.x * axes[0].dot(l).abs() + e.y * axes[1].dot(l).abs() + e.z * axes[2].dot(l).abs()
    };

    let mut candidates = Vec::with_capacity(15);
    candidates.extend_from_slice(&axes_a);
    candidates.extend_from_slice(&axes_b);
    for u in &axes_a {
        for v in &axes_b {
            candidates.push(u.cross(*v));
        }
    }

    let mut best: Option<(f32, Vec3)> = None;
    for (i, axis) in candidates.into_iter().enumerate() {
        let len = axis.length();
        if len < 1.0e-6 {
            continue;
        }
        let l = axis / len;
        let dist = d.dot(l);
        let overlap = project(&axes_a, ea, l) + project(&axes_b, eb, l) - dist.abs();
        if overlap < 0.0 {
            return None;
        }
        // 边轴需要明显更优才替换面轴
        let bias = if i >= 6 { 1.0e-4 } else { 0.0 };
        if best.map_or(true, |(o, _)| overlap + bias < o) {
            best = Some((overlap, if dist < 0.0 { -l } else { l }));
        }
    }

    let (depth, normal) = best?;
    let point_b = support(b.position, &axes_b, eb, -normal);
    Some(Contact {
        normal,
        depth,
        point_a: point_b + normal * depth,
        point_b,
    })
}

/// 长方体在 dir 方向上的支撑点
fn support(center: Vec3, axes: &[Vec3; 3], e: Vec3, dir: Vec3) -> Vec3 {
    let mut p = center;
    for i in 0..3 {
        let s = if axes[i].dot(dir) >= 0.0 { 1.0 } else { -1.0 };
        p += axes[i] * (e[i] * s);
    }
    p
}

// ============================================================================
// 求解
// ============================================================================

/// 刚体对接触修正
pub(crate) fn solve_contact(
    a: &mut Body,
    b: &mut Body,
    contact: &Contact,
    h: f32,
    config: &PhysicsConfig,
) {
    let friction = (a.friction * b.friction).sqrt();
    solve_contact_inner(Some(a), b, contact, friction, h, config);
}

/// 地面接触：以刚体最低点为接触点
pub(crate) fn solve_ground(body: &mut Body, height: f32, h: f32, config: &PhysicsConfig) {
    if !body.is_dynamic() {
        return;
    }
    let lowest = lowest_point(body);
    let depth = height - lowest.y;
    if !(depth > 0.0) {
        return;
    }
    let contact = Contact {
        normal: Vec3::Y,
        depth,
        point_a: Vec3::new(lowest.x, height, lowest.z),
        point_b: lowest,
    };
    let friction = body.friction;
    solve_contact_inner(None, body, &contact, friction, h, config);
}

fn lowest_point(body: &Body) -> Vec3 {
    if body.shape == RigidBodyShape::Box {
        let axes = [body.rotation * Vec3::X, body.rotation * Vec3::Y, body.rotation * Vec3::Z];
        support(body.position, &axes, body.half_extents, Vec3::NEG_Y)
    } else {
        let (p, q) = body.segment();
        let end = if p.y < q.y { p } else { q };
        end - Vec3::Y * body.radius
    }
}

fn solve_contact_inner(
    mut a: Option<&mut Body>,
    b: &mut Body,
    contact: &Contact,
    friction: f32,
    h: f32,
    config: &PhysicsConfig,
) {
    let n = contact.normal;
    let ra = a.as_ref().map_or(Vec3::ZERO, |a| contact.point_a - a.position);
    let rb = contact.point_b - b.position;
    let wa = a.as_ref().map_or(0.0, |a| a.generalized_inv_mass(ra, n));
    let wb = b.generalized_inv_mass(rb, n);
    let w = wa + wb;
    if w <= 0.0 {
        return;
    }

    let alpha = config.contact_compliance / (h * h);
    let lambda_n = contact.depth / (w + alpha);
    if !lambda_n.is_finite() {
        return;
    }
    // 接触点的刚体本地偏移
    let local_b = b.rotation.inverse() * rb;
    let local_a = a.as_ref().map_or(Vec3::ZERO, |a| a.rotation.inverse() * ra);

    let p = n * lambda_n;
    let (max_linear, max_angular) = (config.max_position_correction, config.max_angular_correction);
    b.apply_correction(p, rb, max_linear, max_angular);
    if let Some(a) = a.as_deref_mut() {
        a.apply_correction(-p, ra, max_linear, max_angular);
    }

    // 切向相对位移（相对子步开始时）
    let moved = |body: &Body, local: Vec3| {
        (body.position + body.rotation * local) - (body.prev_position + body.prev_rotation * local)
    };
    let moved_a = a.as_ref().map_or(Vec3::ZERO, |a| moved(&**a, local_a));
    let dp = moved(b, local_b) - moved_a;
    let tangential = dp - n * dp.dot(n);
    let len = tangential.length();
    if !(len > 1.0e-7) {
        return;
    }
    let t = tangential / len;
    let wa = a.as_ref().map_or(0.0, |a| a.generalized_inv_mass(ra, t));
    let w = wa + b.generalized_inv_mass(rb, t);
    if w <= 0.0 {
        return;
    }
    let lambda_t = (len / (w + alpha)).min(friction * lambda_n);
    let pt = -t * lambda_t;
    b.apply_correction(pt, rb, max_linear, max_angular);
    if let Some(a) = a.as_deref_mut() {
        a.apply_correction(-pt, ra, max_linear, max_angular);
    }
}
