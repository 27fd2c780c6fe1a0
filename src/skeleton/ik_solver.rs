//! IK 求解器 - CCD 迭代求解
//!
//! 设计原则：
//! - 每条链在自己的工作区（顶端链接 → 末端效应器的路径）上迭代，
//!   更新某个链接后只重算它到末端的子路径
//! - 单轴（铰链）链接以上一帧的解为参考展开角度，并做帧间限速
//! - 三轴限制链接分解为 X/Y/Z 欧拉角后逐轴钳制
//! - 任何退化（零长度、非有限值）只跳过当前链接，不报错

use glam::{Mat4, Quat, Vec3};

use crate::math::{
    any_perpendicular, compose_euler_xyz, decompose_euler_xyz, signed_angle_in_plane,
    twist_angle, unwrap_angle,
};

use super::bone_link::{IkConfig, IkLink};
use super::model::SkeletonModel;
use super::rig_solver::{BoneState, RigConfig};

// ============================================================================
// IK 链状态
// ============================================================================

/// IK 链接的跨帧状态
#[derive(Clone, Copy, Debug, Default)]
struct IkLinkState {
    /// 单轴模式下已解出的角度
    angle: f32,
    /// 三轴模式下已解出的欧拉角（用于连续性）
    euler: Vec3,
}

/// 工作区节点
#[derive(Clone, Copy, Debug)]
struct ChainNode {
    /// 本地平移（含绑定偏移与付与平移）
    offset: Vec3,
    /// 动画旋转 * 付与旋转
    base_rot: Quat,
    /// IK 旋转
    ik_rot: Quat,
    /// 全局变换
    global: Mat4,
}

impl ChainNode {
    #[inline]
    fn position(&self) -> Vec3 {
        self.global.w_axis.truncate()
    }
}

// ============================================================================
// IK 求解器
// ============================================================================

/// 单条 IK 链求解器
#[derive(Clone, Debug)]
pub struct IkSolver {
    /// IK 骨骼索引（目标位置）
    pub bone_index: usize,
    /// IK 配置（角度已归一化为弧度）
    pub config: IkConfig,
    /// 是否启用
    pub enabled: bool,
    /// 末端效应器骨骼
    effector: usize,
    /// 顶端链接 → 末端效应器
    path: Vec<usize>,
    /// 每个链接在 path 中的位置（无效链接为 None）
    slots: Vec<Option<usize>>,
    /// 上一帧已解出的链接状态
    link_states: Vec<IkLinkState>,
}

impl IkSolver {
    /// 创建 IK 求解器；IK 配置缺失或末端骨骼无效时返回 None
    pub fn new(model: &SkeletonModel, bone_index: usize) -> Option<Self> {
        let config = model.bone(bone_index)?.ik_config.clone()?;
        let Some(effector) = model.resolve(config.target_bone) else {
            log::debug!("IK 骨骼 {} 的目标骨骼 {} 无效，跳过", bone_index, config.target_bone);
            return None;
        };

        // 末端效应器的祖先链（含自身）
        let mut ancestors = vec![effector];
        let mut cur = model.bones()[effector].parent_id();
        while let Some(p) = cur {
            ancestors.push(p);
            cur = model.bones()[p].parent_id();
        }

        let positions: Vec<Option<usize>> = config
            .links
            .iter()
            .map(|link| {
                let idx = model.resolve(link.bone_index)?;
                if idx == effector {
                    return None;
                }
                let pos = ancestors.iter().position(|&a| a == idx);
                if pos.is_none() {
                    log::debug!("IK 链接骨骼 {} 不在末端骨骼 {} 的祖先链上，跳过", idx, effector);
                }
                pos
            })
            .collect();

        let top = positions.iter().flatten().copied().max().unwrap_or(0);
        let path: Vec<usize> = if positions.iter().any(Option::is_some) {
            ancestors[..=top].iter().rev().copied().collect()
        } else {
            Vec::new()
        };
        let slots = positions.iter().map(|p| p.map(|pos| top - pos)).collect();
        let link_states = vec![IkLinkState::default(); config.links.len()];

        Some(Self {
            bone_index,
            config,
            enabled: true,
            effector,
            path,
            slots,
            link_states,
        })
    }

    /// 末端效应器骨骼
    #[inline]
    pub fn effector(&self) -> usize {
        self.effector
    }

    /// 有效链接骨骼
    fn link_bones(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().flatten().map(|&s| self.path[s])
    }

    /// 清除跨帧状态（单轴角度、欧拉角参考）
    pub fn reset_state(&mut self) {
        self.link_states.fill(IkLinkState::default());
    }

    /// 写集合：链接骨骼及其后代，以及付与依赖它们的骨骼（已排序）
    pub(crate) fn write_set(&self, model: &SkeletonModel) -> Vec<usize> {
        let n = model.bone_count();
        let mut mark = vec![false; n];
        for link in self.link_bones() {
            for b in model.subtree(link) {
                mark[b] = true;
            }
        }
        loop {
            let mut changed = false;
            for (i, bone) in model.bones().iter().enumerate() {
                if mark[i] {
                    continue;
                }
                let grant_parent = bone
                    .grant_config
                    .as_ref()
                    .and_then(|g| model.resolve(g.parent));
                if grant_parent.is_some_and(|gp| mark[gp]) {
                    for b in model.subtree(i) {
                        mark[b] = true;
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        (0..n).filter(|&i| mark[i]).collect()
    }

    /// 读集合：求解路径、路径上方祖先、IK 骨骼及其祖先、路径骨骼的付与父骨骼（已排序）
    pub(crate) fn read_set(&self, model: &SkeletonModel) -> Vec<usize> {
        let n = model.bone_count();
        let mut mark = vec![false; n];
        let mark_with_ancestors = |start: usize, mark: &mut Vec<bool>| {
            let mut cur = Some(start);
            while let Some(b) = cur {
                mark[b] = true;
                cur = model.bones()[b].parent_id();
            }
        };
        if let Some(&top) = self.path.first() {
            mark_with_ancestors(top, &mut mark);
        }
        mark_with_ancestors(self.bone_index, &mut mark);
        for &b in &self.path {
            mark[b] = true;
            if let Some(gp) = model.bones()[b]
                .grant_config
                .as_ref()
                .and_then(|g| model.resolve(g.parent))
            {
                mark[gp] = true;
            }
        }
        (0..n).filter(|&i| mark[i]).collect()
    }

    /// 求解 IK
    ///
    /// 只读取 `states`，返回每个有效链接的新 IK 旋转，由调用方统一写回。
    pub fn solve(
        &mut self,
        model: &SkeletonModel,
        states: &[BoneState],
        config: &RigConfig,
    ) -> Vec<(usize, Quat)> {
        if !self.enabled || self.path.is_empty() || self.bone_index >= states.len() {
            return Vec::new();
        }

        let goal = states[self.bone_index].global_matrix.w_axis.truncate();
        if !goal.is_finite() {
            return Vec::new();
        }

        let top_parent = model.bones()[self.path[0]]
            .parent_id()
            .map(|p| states[p].global_matrix)
            .unwrap_or(Mat4::IDENTITY);

        let mut nodes: Vec<ChainNode> = self
            .path
            .iter()
            .map(|&b| {
                let s = &states[b];
                ChainNode {
                    offset: model.bones()[b].bone_offset() + s.translation + s.grant_translation,
                    base_rot: s.rotation * s.grant_rotation,
                    ik_rot: s.ik_rotation,
                    global: s.global_matrix,
                }
            })
            .collect();

        // 单轴链接从上一帧的解继续
        let mut resolved = self.link_states.clone();
        let mut warm_started = false;
        for (li, link) in self.config.links.iter().enumerate() {
            let (Some(slot), Some(axis)) = (self.slots[li], link.hinge_axis()) else {
                continue;
            };
            let angle = resolved[li].angle.clamp(link.limit_min[axis], link.limit_max[axis]);
            resolved[li].angle = angle;
            let total = Quat::from_axis_angle(unit_axis(axis), angle);
            nodes[slot].ik_rot = (total * nodes[slot].base_rot.inverse()).normalize();
            warm_started = true;
        }
        if warm_started {
            update_nodes(&mut nodes, top_parent, 0);
        }

        let epsilon = config.ik_convergence_epsilon;
        let mut best_distance = distance_sq(&nodes, goal);
        let mut best_rotations: Vec<Quat> = nodes.iter().map(|n| n.ik_rot).collect();
        let mut best_resolved = resolved.clone();

        for _ in 0..self.config.iterations {
            if best_distance < epsilon {
                break;
            }

            self.solve_iteration(&mut nodes, top_parent, goal, config, &mut resolved);

            let distance = distance_sq(&nodes, goal);
            if distance.is_finite() && distance < best_distance {
                best_distance = distance;
                for (best, node) in best_rotations.iter_mut().zip(&nodes) {
                    *best = node.ik_rot;
                }
                best_resolved.copy_from_slice(&resolved);
            } else {
                // 恢复最佳结果并退出
                for (node, best) in nodes.iter_mut().zip(&best_rotations) {
                    node.ik_rot = *best;
                }
                update_nodes(&mut nodes, top_parent, 0);
                break;
            }
        }

        self.link_states = best_resolved;

        self.slots
            .iter()
            .flatten()
            .map(|&slot| (self.path[slot], best_rotations[slot]))
            .collect()
    }

    /// 单次迭代：从末端向根部依次处理每个链接
    fn solve_iteration(
        &self,
        nodes: &mut [ChainNode],
        top_parent: Mat4,
        goal: Vec3,
        config: &RigConfig,
        resolved: &mut [IkLinkState],
    ) {
        for (li, link) in self.config.links.iter().enumerate() {
            let Some(slot) = self.slots[li] else {
                continue;
            };
            let updated = match link.hinge_axis() {
                Some(axis) => self.solve_hinge(
                    nodes,
                    top_parent,
                    slot,
                    link,
                    axis,
                    goal,
                    config,
                    self.link_states[li].angle,
                    &mut resolved[li],
                ),
                None => self.solve_ball(nodes, top_parent, slot, link, goal, &mut resolved[li]),
            };
            if updated {
                update_nodes(nodes, top_parent, slot);
            }
        }
    }

    /// 单轴求解（膝盖等关节）
    #[allow(clippy::too_many_arguments)]
    fn solve_hinge(
        &self,
        nodes: &mut [ChainNode],
        top_parent: Mat4,
        slot: usize,
        link: &IkLink,
        axis_index: usize,
        goal: Vec3,
        config: &RigConfig,
        previous_angle: f32,
        state: &mut IkLinkState,
    ) -> bool {
        let axis = unit_axis(axis_index);
        let effector = nodes[nodes.len() - 1].position();

        // 旋转前的链接坐标系（父变换 * 本地平移）
        let frame = parent_global(nodes, top_parent, slot)
            * Mat4::from_translation(nodes[slot].offset);
        let inv_frame = frame.inverse();
        if !inv_frame.is_finite() {
            return false;
        }
        let local_effector = inv_frame.transform_point3(effector);
        let local_goal = inv_frame.transform_point3(goal);

        let Some(delta) = signed_angle_in_plane(local_effector, local_goal, axis) else {
            return false;
        };
        let delta = delta.clamp(-self.config.limit_angle, self.config.limit_angle);

        let total = nodes[slot].ik_rot * nodes[slot].base_rot;
        let current = unwrap_angle(twist_angle(total, axis), previous_angle);

        let residual = (effector - goal).length();
        let rate_cap = if residual > config.hinge_near_distance {
            config.hinge_rate_cap_far
        } else {
            config.hinge_rate_cap_near
        };

        let new_angle = (current + delta)
            .clamp(previous_angle - rate_cap, previous_angle + rate_cap)
            .clamp(link.limit_min[axis_index], link.limit_max[axis_index]);
        if !new_angle.is_finite() {
            return false;
        }

        let ik_rot = (Quat::from_axis_angle(axis, new_angle) * nodes[slot].base_rot.inverse())
            .normalize();
        if !ik_rot.is_finite() {
            return false;
        }
        nodes[slot].ik_rot = ik_rot;
        state.angle = new_angle;
        true
    }

    /// 通用 3 轴求解
    fn solve_ball(
        &self,
        nodes: &mut [ChainNode],
        top_parent: Mat4,
        slot: usize,
        link: &IkLink,
        goal: Vec3,
        state: &mut IkLinkState,
    ) -> bool {
        let effector = nodes[nodes.len() - 1].position();
        let link_pos = nodes[slot].position();

        let to_effector = effector - link_pos;
        let to_goal = goal - link_pos;
        if to_effector.length_squared() < 1.0e-10 || to_goal.length_squared() < 1.0e-10 {
            return false;
        }
        let to_effector = to_effector.normalize();
        let to_goal = to_goal.normalize();

        let dot = to_effector.dot(to_goal).clamp(-1.0, 1.0);
        let angle = dot.acos();
        if !(angle > 1.0e-5) {
            return false;
        }
        let angle = angle.min(self.config.limit_angle);

        let mut axis = to_effector.cross(to_goal);
        if axis.length_squared() < 1.0e-12 {
            if dot < 0.0 {
                // 正好反向：任取一条垂直轴
                axis = any_perpendicular(to_effector);
            } else {
                return false;
            }
        }
        let axis = axis.normalize();

        // 旋转轴转换到父骨骼本地空间
        let parent_rot = Quat::from_mat4(&parent_global(nodes, top_parent, slot)).normalize();
        let local_axis = (parent_rot.inverse() * axis).normalize_or_zero();
        if local_axis == Vec3::ZERO {
            return false;
        }

        let total = nodes[slot].ik_rot * nodes[slot].base_rot;
        let mut new_total = (Quat::from_axis_angle(local_axis, angle) * total).normalize();

        if link.has_limits {
            let mut euler = decompose_euler_xyz(new_total, state.euler);
            for i in 0..3 {
                let (lo, hi) = (link.limit_min[i], link.limit_max[i]);
                euler[i] = if (hi - lo).abs() < 1.0e-6 && lo.abs() < 1.0e-6 {
                    // 锁定轴精确归零，防止漂移
                    0.0
                } else {
                    euler[i].clamp(lo, hi)
                };
            }
            new_total = compose_euler_xyz(euler);
            state.euler = euler;
        }

        let ik_rot = (new_total * nodes[slot].base_rot.inverse()).normalize();
        if !ik_rot.is_finite() {
            return false;
        }
        nodes[slot].ik_rot = ik_rot;
        true
    }
}

#[inline]
fn unit_axis(index: usize) -> Vec3 {
    match index {
        0 => Vec3::X,
        1 => Vec3::Y,
        _ => Vec3::Z,
    }
}

#[inline]
fn parent_global(nodes: &[ChainNode], top_parent: Mat4, slot: usize) -> Mat4 {
    if slot == 0 {
        top_parent
    } else {
        nodes[slot - 1].global
    }
}

#[inline]
fn distance_sq(nodes: &[ChainNode], goal: Vec3) -> f32 {
    nodes
        .last()
        .map(|n| (n.position() - goal).length_squared())
        .unwrap_or(f32::MAX)
}

/// 从 from 开始沿路径重算全局变换
fn update_nodes(nodes: &mut [ChainNode], top_parent: Mat4, from: usize) {
    for i in from..nodes.len() {
        let parent = parent_global(nodes, top_parent, i);
        let rotation = (nodes[i].ik_rot * nodes[i].base_rot).normalize();
        let global = parent * Mat4::from_rotation_translation(rotation, nodes[i].offset);
        if global.is_finite() {
            nodes[i].global = global;
        }
    }
}
