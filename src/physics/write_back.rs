//! 物理结果回写骨骼的顺序
//!
//! 依赖图 = 骨骼父子边（连到最近的可回写祖先）+ 关节边。
//! 关节边方向：有祖先关系时从祖先指向后代，否则按 (深度, 索引) 决定，
//! 因此所有边都严格增加 (深度, 索引)，图必定无环。
//! Kahn 排序时用 (深度, 索引) 最小堆打破平局，结果确定。

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::skeleton::SkeletonModel;

use super::config::WriteBackPolicy;
use super::definition::BodyMode;
use super::joint::JointConstraint;
use super::rigid_body::Body;

/// 选出参与回写的刚体
pub(crate) fn eligible_bodies(bodies: &[Body], policy: WriteBackPolicy) -> Vec<usize> {
    let candidate = |b: &Body| b.is_dynamic() && b.bone_index.is_some() && !b.auto_generated;
    let select = |pred: &dyn Fn(&Body) -> bool| -> Vec<usize> {
        bodies
            .iter()
            .enumerate()
            .filter(|(_, b)| candidate(b) && pred(b))
            .map(|(i, _)| i)
            .collect()
    };

    match policy {
        WriteBackPolicy::AllDynamic => select(&|_| true),
        WriteBackPolicy::AfterAnimationFlag => {
            if bodies.iter().any(|b| candidate(b) && b.after_animation) {
                select(&|b| b.after_animation)
            } else {
                let fallback = select(&|b| b.mode == BodyMode::PhysicsWithBone);
                if bodies.iter().any(candidate) {
                    log::warn!(
                        "没有刚体标记为动画后解算，只回写 {} 个物理+骨骼位置刚体",
                        fallback.len()
                    );
                }
                fallback
            }
        }
    }
}

/// 计算回写顺序（返回刚体索引）
pub(crate) fn build_order(
    model: &SkeletonModel,
    bodies: &[Body],
    eligible: &[usize],
    joints: &[JointConstraint],
) -> Vec<usize> {
    let bone_count = model.bone_count();

    // 每根骨骼一个节点 (骨骼, 刚体)
    let mut node_of_bone: Vec<Option<usize>> = vec![None; bone_count];
    let mut nodes: Vec<(usize, usize)> = Vec::new();
    for &body in eligible {
        let Some(bone) = bodies[body].bone_index.filter(|&b| b < bone_count) else {
            continue;
        };
        if node_of_bone[bone].is_none() {
            node_of_bone[bone] = Some(nodes.len());
            nodes.push((bone, body));
        }
    }

    let key = |node: usize| {
        let bone = nodes[node].0;
        (model.depth(bone), bone)
    };

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    // 骨骼边：最近的可回写祖先 → 自身
    for (i, &(bone, _)) in nodes.iter().enumerate() {
        let mut cur = model.bones()[bone].parent_id();
        while let Some(p) = cur {
            if let Some(j) = node_of_bone[p] {
                successors[j].push(i);
                break;
            }
            cur = model.bones()[p].parent_id();
        }
    }

    // 关节边
    let node_of_body = |body: usize| {
        bodies
            .get(body)
            .and_then(|b| b.bone_index)
            .and_then(|bone| node_of_bone.get(bone).copied().flatten())
    };
    for joint in joints {
        let (Some(x), Some(y)) = (node_of_body(joint.body_a), node_of_body(joint.body_b)) else {
            continue;
        };
        if x == y {
            continue;
        }
        let (bx, by) = (nodes[x].0, nodes[y].0);
        let (from, to) = if model.is_ancestor(bx, by) {
            (x, y)
        } else if model.is_ancestor(by, bx) {
            (y, x)
        } else if key(x) < key(y) {
            (x, y)
        } else {
            (y, x)
        };
        successors[from].push(to);
    }

    let mut in_degree = vec![0usize; nodes.len()];
    for list in successors.iter_mut() {
        list.sort_unstable();
        list.dedup();
        for &to in list.iter() {
            in_degree[to] += 1;
        }
    }

    let mut heap: BinaryHeap<Reverse<((u32, usize), usize)>> = (0..nodes.len())
        .filter(|&i| in_degree[i] == 0)
        .map(|i| Reverse((key(i), i)))
        .collect();
    let mut placed = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse((_, i))) = heap.pop() {
        placed[i] = true;
        order.push(i);
        for &to in &successors[i] {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                heap.push(Reverse((key(to), to)));
            }
        }
    }

    if order.len() < nodes.len() {
        let mut rest: Vec<usize> = (0..nodes.len()).filter(|&i| !placed[i]).collect();
        log::warn!("回写顺序无法完全排序，{} 个节点按 (深度, 索引) 追加", rest.len());
        rest.sort_by_key(|&i| key(i));
        order.extend(rest);
    }

    order.into_iter().map(|i| nodes[i].1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::config::PhysicsConfig;
    use crate::physics::definition::{JointDef, RigidBodyDef, RigidBodyShape};
    use crate::skeleton::BoneLink;
    use glam::{Mat4, Vec3};

    fn body(bone: usize, mode: BodyMode, after_animation: bool) -> Body {
        let (shape, size) = (RigidBodyShape::Sphere, Vec3::splat(0.2));
        let def = RigidBodyDef::new("b", bone as i32, shape, size, Vec3::ZERO, mode)
            .with_after_animation(after_animation);
        Body::from_def(&def, Some(bone), Some(Mat4::IDENTITY), &PhysicsConfig::default())
    }

    fn chain_model() -> SkeletonModel {
        SkeletonModel::new(vec![
            BoneLink::new("root", Vec3::ZERO, -1),
            BoneLink::new("a", Vec3::Y, 0),
            BoneLink::new("b", Vec3::Y * 2.0, 1),
            BoneLink::new("c", Vec3::Y * 3.0, 2),
            BoneLink::new("side", Vec3::X, 0),
        ])
    }

    #[test]
    fn test_fallback_to_physics_with_bone() {
        let bodies = vec![
            body(1, BodyMode::Physics, false),
            body(2, BodyMode::PhysicsWithBone, false),
            body(0, BodyMode::FollowBone, false),
        ];
        assert_eq!(eligible_bodies(&bodies, WriteBackPolicy::AfterAnimationFlag), vec![1]);
        assert_eq!(eligible_bodies(&bodies, WriteBackPolicy::AllDynamic), vec![0, 1]);
    }

    #[test]
    fn test_order_parent_before_child() {
        let model = chain_model();
        // 故意逆序
        let bodies = vec![
            body(3, BodyMode::Physics, true),
            body(1, BodyMode::Physics, true),
            body(4, BodyMode::Physics, true),
            body(2, BodyMode::Physics, true),
        ];
        let eligible = eligible_bodies(&bodies, WriteBackPolicy::AfterAnimationFlag);
        let order = build_order(&model, &bodies, &eligible, &[]);
        let bones: Vec<usize> = order.iter().map(|&b| bodies[b].bone_index.unwrap()).collect();
        assert_eq!(bones, vec![1, 4, 2, 3]);
    }

    #[test]
    fn test_joint_edge_between_unrelated_bones() {
        let model = chain_model();
        let bodies = vec![body(4, BodyMode::Physics, true), body(3, BodyMode::Physics, true)];
        let def = JointDef::new("j", 1, 0, Vec3::ZERO);
        let (frame_a, frame_b) = (bodies[1].transform(), bodies[0].transform());
        let joint = JointConstraint::from_def(&def, 1, 0, frame_a, frame_b);
        let eligible = eligible_bodies(&bodies, WriteBackPolicy::AfterAnimationFlag);
        let order = build_order(&model, &bodies, &eligible, &[joint]);
        // side 深度 1，c 深度 3
        assert_eq!(order, vec![0, 1]);
    }
}
