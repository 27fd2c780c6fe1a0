//! 骨骼系统
//!
//! 核心设计思想：
//! - BoneLink / SkeletonModel: 只读的骨骼层级（索引寻址的扁平数组）
//! - RigSolver: 独占全部 BoneState，负责 FK、付与、IK 与蒙皮矩阵
//! - IkSolver: 单条 IK 链的 CCD 求解器
//! - IkSchedule: 按读写集合把 IK 链分成可并行的阶段

mod bone_link;
mod ik_schedule;
mod ik_solver;
mod model;
mod rig_solver;

pub use bone_link::{BoneFlags, BoneLink, GrantConfig, GrantKind, IkConfig, IkLink};
pub use ik_schedule::IkSchedule;
pub use ik_solver::IkSolver;
pub use model::{AngleUnit, SkeletonModel};
pub use rig_solver::{BoneState, RigConfig, RigSolver};

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};

// ============================================================================
// 公共类型定义
// ============================================================================

/// 骨骼变换数据（本地平移 + 旋转）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneTransform {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for BoneTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl BoneTransform {
    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// 转换为 4x4 矩阵
    #[inline]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.translation)
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.translation.is_finite() && self.rotation.is_finite()
    }
}

/// 每帧骨骼姿态（按名称覆盖平移 / 旋转）
///
/// 由外部关键帧求值器产生；未出现的骨骼保持单位本地变换。
#[derive(Clone, Debug, Default)]
pub struct BonePose {
    pub translations: HashMap<String, Vec3>,
    pub rotations: HashMap<String, Quat>,
}

impl BonePose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_translation(&mut self, name: impl Into<String>, translation: Vec3) -> &mut Self {
        self.translations.insert(name.into(), translation);
        self
    }

    pub fn set_rotation(&mut self, name: impl Into<String>, rotation: Quat) -> &mut Self {
        self.rotations.insert(name.into(), rotation);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.translations.is_empty() && self.rotations.is_empty()
    }
}
