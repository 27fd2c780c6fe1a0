//! 自动碰撞体
//!
//! 为没有刚体的骨骼生成运动学胶囊，让头发 / 裙子等动态刚体
//! 能与身体碰撞。每根父骨骼最多一个，按骨骼边长度从长到短选取。

use glam::{EulerRot, Quat, Vec3};

use crate::skeleton::SkeletonModel;

use super::config::{AutoColliderPolicy, GroupMaskSemantics};
use super::definition::{BodyMode, RigidBodyDef, RigidBodyShape};

/// 生成自动碰撞体定义
///
/// `owned[i]` 为 true 表示骨骼 i 已有刚体。
pub(crate) fn generate(
    model: &SkeletonModel,
    owned: &[bool],
    policy: &AutoColliderPolicy,
    semantics: GroupMaskSemantics,
) -> Vec<RigidBodyDef> {
    if !policy.enabled || policy.max_count == 0 {
        return Vec::new();
    }

    // 每根父骨骼取最长的子骨骼边
    let mut best: Vec<Option<(f32, usize)>> = vec![None; model.bone_count()];
    for (child, bone) in model.bones().iter().enumerate() {
        let Some(parent) = bone.parent_id() else {
            continue;
        };
        if owned.get(parent).copied().unwrap_or(false) {
            continue;
        }
        let length = (bone.initial_position - model.bones()[parent].initial_position).length();
        if !(length >= policy.min_length) || !length.is_finite() {
            continue;
        }
        let slot = &mut best[parent];
        if slot.map_or(true, |(l, _)| length > l) {
            *slot = Some((length, child));
        }
    }

    let mut edges: Vec<(f32, usize, usize)> = best
        .iter()
        .enumerate()
        .filter_map(|(parent, slot)| slot.map(|(length, child)| (length, parent, child)))
        .collect();
    edges.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    edges.truncate(policy.max_count);

    let group = policy.group.min(15);
    let bit = 1u16 << group;
    let mask = match semantics {
        GroupMaskSemantics::CollideWith => !bit,
        GroupMaskSemantics::Ignore => bit,
    };

    edges
        .into_iter()
        .map(|(length, parent, child)| {
            let head = model.bones()[parent].initial_position;
            let tail = model.bones()[child].initial_position;
            let dir = (tail - head) / length;

            let radius = (length * policy.radius_ratio).min(policy.max_radius).max(1.0e-3);
            let height = (length - 2.0 * radius).max(0.0);

            // 胶囊长轴（本地 Y）对齐骨骼方向，转为 YXZ 欧拉角
            let (y, x, z) = Quat::from_rotation_arc(Vec3::Y, dir).to_euler(EulerRot::YXZ);

            RigidBodyDef::new(
                format!("auto:{}", model.bones()[parent].name),
                parent as i32,
                RigidBodyShape::Capsule,
                Vec3::new(radius, height, 0.0),
                (head + tail) * 0.5,
                BodyMode::FollowBone,
            )
            .with_rotation(Vec3::new(x, y, z))
            .with_mass(0.0)
            .with_group(group, mask)
        })
        .collect()
}
