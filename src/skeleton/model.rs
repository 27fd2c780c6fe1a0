//! 骨骼模型 - 加载后只读的骨骼层级
//!
//! 构建时完成：非法引用清理、IK 角度单位归一化、父骨骼偏移、
//! 稳定拓扑顺序（父骨骼在前；就绪的骨骼按变换层级、再按原始索引）以及子骨骼 / 深度缓存。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::math::looks_like_degrees;

use super::bone_link::BoneLink;

/// IK 角度单位
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AngleUnit {
    /// 按链检测：任一角度超过一整圈即视为角度制
    #[default]
    Auto,
    Radians,
    Degrees,
}

/// 骨骼模型
#[derive(Clone, Debug)]
pub struct SkeletonModel {
    bones: Vec<BoneLink>,
    name_to_index: HashMap<String, usize>,
    /// 求值顺序（父在子前，平局按层级，索引）
    eval_order: Vec<usize>,
    children: Vec<Vec<usize>>,
    depth: Vec<u32>,
    ik_bones: Vec<usize>,
    revision: u64,
}

impl SkeletonModel {
    pub fn new(bones: Vec<BoneLink>) -> Self {
        Self::with_angle_unit(bones, AngleUnit::Auto)
    }

    pub fn with_angle_unit(mut bones: Vec<BoneLink>, unit: AngleUnit) -> Self {
        let count = bones.len();

        // 非法父引用视为根骨骼
        for i in 0..count {
            let parent = bones[i].parent_index;
            if parent >= 0 && (parent as usize >= count || parent as usize == i) {
                log::debug!("骨骼 '{}' 的父索引 {} 无效，按根骨骼处理", bones[i].name, parent);
                bones[i].parent_index = -1;
            }
        }
        break_parent_cycles(&mut bones);

        for i in 0..count {
            bones[i].body_shift = match bones[i].parent_id() {
                Some(p) => bones[i].initial_position - bones[p].initial_position,
                None => bones[i].initial_position,
            };
        }

        for bone in bones.iter_mut() {
            normalize_ik_units(bone, unit);
        }

        let mut children = vec![Vec::new(); count];
        for (i, bone) in bones.iter().enumerate() {
            if let Some(p) = bone.parent_id() {
                children[p].push(i);
            }
        }
        let eval_order = topological_order(&bones, &children);

        let depth = (0..count)
            .map(|i| {
                let mut d = 0;
                let mut cur = bones[i].parent_id();
                while let Some(p) = cur {
                    d += 1;
                    cur = bones[p].parent_id();
                }
                d
            })
            .collect();

        let mut name_to_index = HashMap::with_capacity(count);
        for (i, bone) in bones.iter().enumerate() {
            name_to_index.entry(bone.name.clone()).or_insert(i);
        }

        let ik_bones = bones
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_ik())
            .map(|(i, _)| i)
            .collect();

        Self {
            bones,
            name_to_index,
            eval_order,
            children,
            depth,
            ik_bones,
            revision: 0,
        }
    }

    #[inline]
    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn bones(&self) -> &[BoneLink] {
        &self.bones
    }

    #[inline]
    pub fn bone(&self, index: usize) -> Option<&BoneLink> {
        self.bones.get(index)
    }

    /// 通过名称查找骨骼（重名时取第一个）
    pub fn find_bone(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// 把可能为负或越界的索引转换为合法索引
    #[inline]
    pub fn resolve(&self, index: i32) -> Option<usize> {
        (index >= 0 && (index as usize) < self.bones.len()).then_some(index as usize)
    }

    #[inline]
    pub fn eval_order(&self) -> &[usize] {
        &self.eval_order
    }

    #[inline]
    pub fn children(&self, index: usize) -> &[usize] {
        self.children.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    #[inline]
    pub fn depth(&self, index: usize) -> u32 {
        self.depth.get(index).copied().unwrap_or(0)
    }

    #[inline]
    pub fn ik_bones(&self) -> &[usize] {
        &self.ik_bones
    }

    /// ancestor 是否为 bone 的（严格）祖先
    pub fn is_ancestor(&self, ancestor: usize, bone: usize) -> bool {
        let mut cur = self.bones.get(bone).and_then(BoneLink::parent_id);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.bones[p].parent_id();
        }
        false
    }

    /// 包含自身的全部后代（前序）
    pub fn subtree(&self, root: usize) -> Vec<usize> {
        let mut out = Vec::new();
        if root >= self.bones.len() {
            return out;
        }
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            out.push(i);
            stack.extend(self.children[i].iter().rev().copied());
        }
        out
    }

    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// 使派生缓存（BoneState / Body / JointConstraint）失效
    pub fn bump_revision(&mut self) {
        self.revision += 1;
    }
}

/// 父链存在环时断开环上索引最大的骨骼
fn break_parent_cycles(bones: &mut [BoneLink]) {
    const UNVISITED: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNVISITED; bones.len()];
    for start in 0..bones.len() {
        let mut path: Vec<usize> = Vec::new();
        let mut cur = Some(start);
        while let Some(i) = cur {
            match state[i] {
                DONE => break,
                ON_PATH => {
                    let from = path.iter().position(|&p| p == i).unwrap_or(0);
                    if let Some(&victim) = path[from..].iter().max() {
                        log::warn!("骨骼 '{}' 的父链存在环，断开", bones[victim].name);
                        bones[victim].parent_index = -1;
                    }
                    break;
                }
                _ => {
                    state[i] = ON_PATH;
                    path.push(i);
                    cur = bones[i].parent_id();
                }
            }
        }
        for i in path {
            state[i] = DONE;
        }
    }
}

/// Kahn 排序：父骨骼总在子骨骼之前，就绪骨骼按 (层级, 索引) 取最小
fn topological_order(bones: &[BoneLink], children: &[Vec<usize>]) -> Vec<usize> {
    let key = |i: usize| Reverse((bones[i].transform_level, i));
    let mut heap: BinaryHeap<_> = (0..bones.len())
        .filter(|&i| bones[i].parent_id().is_none())
        .map(key)
        .collect();
    let mut order = Vec::with_capacity(bones.len());
    while let Some(Reverse((_, i))) = heap.pop() {
        order.push(i);
        heap.extend(children[i].iter().map(|&c| key(c)));
    }
    order
}

/// IK 角度单位归一化（整条链一起判断）
fn normalize_ik_units(bone: &mut BoneLink, unit: AngleUnit) {
    let Some(ik) = bone.ik_config.as_mut() else {
        return;
    };
    let degrees = match unit {
        AngleUnit::Radians => false,
        AngleUnit::Degrees => true,
        AngleUnit::Auto => {
            let values = std::iter::once(ik.limit_angle).chain(
                ik.links
                    .iter()
                    .filter(|l| l.has_limits)
                    .flat_map(|l| l.limit_min.to_array().into_iter().chain(l.limit_max.to_array())),
            );
            looks_like_degrees(values)
        }
    };
    if !degrees {
        return;
    }
    log::debug!("IK '{}' 的角度按角度制换算为弧度", bone.name);
    ik.limit_angle = ik.limit_angle.to_radians();
    for link in ik.links.iter_mut() {
        link.limit_min = link.limit_min * std::f32::consts::PI / 180.0;
        link.limit_max = link.limit_max * std::f32::consts::PI / 180.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{IkConfig, IkLink};
    use glam::Vec3;

    #[test]
    fn test_eval_order_by_level_then_index() {
        let bones = vec![
            BoneLink::new("root", Vec3::ZERO, -1),
            BoneLink::new("late", Vec3::Y, 0).with_level(1),
            BoneLink::new("early", Vec3::X, 0),
        ];
        let model = SkeletonModel::new(bones);
        assert_eq!(model.eval_order(), &[0, 2, 1]);
        assert_eq!(model.bones()[2].bone_offset(), Vec3::X);
    }

    #[test]
    fn test_eval_order_parent_before_child() {
        let bones = vec![
            BoneLink::new("child", Vec3::Y * 3.0, 1),
            BoneLink::new("parent", Vec3::Y, -1),
            BoneLink::new("grandchild", Vec3::Y * 4.0, 0).with_level(-1),
        ];
        let model = SkeletonModel::new(bones);
        assert_eq!(model.eval_order(), &[1, 0, 2]);
    }

    #[test]
    fn test_malformed_parent_becomes_root() {
        let bones = vec![
            BoneLink::new("a", Vec3::ZERO, 5),
            BoneLink::new("b", Vec3::Y, 1),
        ];
        let model = SkeletonModel::new(bones);
        assert!(model.bones()[0].is_root());
        assert!(model.bones()[1].is_root());
    }

    #[test]
    fn test_parent_cycle_is_broken() {
        let bones = vec![
            BoneLink::new("a", Vec3::ZERO, 1),
            BoneLink::new("b", Vec3::Y, 0),
        ];
        let model = SkeletonModel::new(bones);
        assert!(model.bones().iter().any(BoneLink::is_root));
        assert!(model.depth(0) <= 1 && model.depth(1) <= 1);
        assert_eq!(model.eval_order().len(), 2);
    }

    #[test]
    fn test_cycle_broken_at_highest_index() {
        // x 挂在环 a <-> b 上，x 本身不在环里
        let bones = vec![
            BoneLink::new("x", Vec3::ZERO, 1),
            BoneLink::new("a", Vec3::Y, 2),
            BoneLink::new("b", Vec3::X, 1),
        ];
        let model = SkeletonModel::new(bones);
        assert!(model.bones()[2].is_root());
        assert_eq!(model.bones()[1].parent_id(), Some(2));
        assert_eq!(model.bones()[0].parent_id(), Some(1));
        assert_eq!(model.eval_order(), &[2, 1, 0]);
    }

    #[test]
    fn test_ik_degrees_detected() {
        let ik = IkConfig {
            target_bone: 2,
            iterations: 10,
            limit_angle: 57.29578,
            links: vec![IkLink::limited(1, Vec3::ZERO, Vec3::new(150.0, 0.0, 0.0))],
        };
        let bones = vec![
            BoneLink::new("hip", Vec3::ZERO, -1),
            BoneLink::new("knee", Vec3::Y, 0),
            BoneLink::new("ankle", Vec3::ZERO, 1),
            BoneLink::new("ik", Vec3::ZERO, -1).with_ik(ik),
        ];
        let model = SkeletonModel::new(bones);
        let ik = model.bones()[3].ik_config.as_ref().unwrap();
        assert!((ik.limit_angle - 1.0).abs() < 1e-4);
        assert!((ik.links[0].limit_max.x - 150f32.to_radians()).abs() < 1e-4);
        assert_eq!(model.ik_bones(), &[3]);
    }

    #[test]
    fn test_subtree_and_ancestry() {
        let bones = vec![
            BoneLink::new("root", Vec3::ZERO, -1),
            BoneLink::new("a", Vec3::Y, 0),
            BoneLink::new("b", Vec3::Y * 2.0, 1),
            BoneLink::new("c", Vec3::X, 0),
        ];
        let model = SkeletonModel::new(bones);
        assert_eq!(model.subtree(1), vec![1, 2]);
        assert!(model.is_ancestor(0, 2));
        assert!(!model.is_ancestor(3, 2));
        assert_eq!(model.depth(2), 2);
    }
}
