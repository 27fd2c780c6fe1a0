//! 骨骼节点 - 静态骨骼定义
//!
//! BoneLink 只保存加载后不变的数据（名称、父子关系、付与、IK 链）。
//! 每帧变化的状态放在 `BoneState` 中，由 `RigSolver` 独占。

use bitflags::bitflags;
use glam::Vec3;

// ============================================================================
// 骨骼标志
// ============================================================================

bitflags! {
    /// 骨骼标志位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        /// 可旋转
        const ROTATABLE = 1 << 0;
        /// 可移动
        const MOVABLE = 1 << 1;
        /// 是 IK 骨骼
        const IK = 1 << 2;
        /// 付与旋转
        const GRANT_ROTATE = 1 << 3;
        /// 付与平移
        const GRANT_TRANSLATE = 1 << 4;
    }
}

// ============================================================================
// IK 配置
// ============================================================================

/// IK 链接信息
#[derive(Clone, Debug)]
pub struct IkLink {
    /// 链接骨骼索引
    pub bone_index: i32,
    /// 是否有角度限制
    pub has_limits: bool,
    /// 角度下限（构建模型后为弧度）
    pub limit_min: Vec3,
    /// 角度上限（构建模型后为弧度）
    pub limit_max: Vec3,
}

impl IkLink {
    /// 无限制链接
    pub fn free(bone_index: i32) -> Self {
        Self {
            bone_index,
            has_limits: false,
            limit_min: Vec3::ZERO,
            limit_max: Vec3::ZERO,
        }
    }

    /// 带欧拉角限制的链接
    pub fn limited(bone_index: i32, limit_min: Vec3, limit_max: Vec3) -> Self {
        Self {
            bone_index,
            has_limits: true,
            limit_min: limit_min.min(limit_max),
            limit_max: limit_min.max(limit_max),
        }
    }

    /// 单轴（铰链）模式：只有一个轴有非零范围，其余两轴锁定为 0
    pub fn hinge_axis(&self) -> Option<usize> {
        if !self.has_limits {
            return None;
        }
        let active = |i: usize| self.limit_min[i] != 0.0 || self.limit_max[i] != 0.0;
        match (active(0), active(1), active(2)) {
            (true, false, false) => Some(0),
            (false, true, false) => Some(1),
            (false, false, true) => Some(2),
            _ => None,
        }
    }
}

/// IK 配置
#[derive(Clone, Debug)]
pub struct IkConfig {
    /// 末端效应器骨骼索引（被拉向 IK 骨骼位置的骨骼）
    pub target_bone: i32,
    /// 迭代次数
    pub iterations: u32,
    /// 单次迭代角度限制
    pub limit_angle: f32,
    /// IK 链接列表（从末端向根部）
    pub links: Vec<IkLink>,
}

// ============================================================================
// 付与（继承）配置
// ============================================================================

/// 付与种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GrantKind {
    #[default]
    Rotation,
    Translation,
    Both,
}

impl GrantKind {
    #[inline]
    pub fn rotates(self) -> bool {
        matches!(self, GrantKind::Rotation | GrantKind::Both)
    }

    #[inline]
    pub fn translates(self) -> bool {
        matches!(self, GrantKind::Translation | GrantKind::Both)
    }
}

/// 付与配置
#[derive(Clone, Debug, Default)]
pub struct GrantConfig {
    /// 付与父骨骼索引
    pub parent: i32,
    /// 付与比率（可以为负或超过 1）
    pub rate: f32,
    /// 付与种类
    pub kind: GrantKind,
}

// ============================================================================
// 骨骼节点
// ============================================================================

/// 静态骨骼定义
#[derive(Clone, Debug)]
pub struct BoneLink {
    /// 骨骼名称
    pub name: String,

    /// 父骨骼索引 (-1 表示根骨骼)
    pub parent_index: i32,

    /// 变换层级（用于排序）
    pub transform_level: i32,

    /// 骨骼标志
    pub flags: BoneFlags,

    /// 初始位置（模型空间，绑定姿态）
    pub initial_position: Vec3,

    /// 尾端 / 朝向目标骨骼索引 (-1 表示无)
    pub tail_index: i32,

    /// IK 配置
    pub ik_config: Option<IkConfig>,

    /// 付与配置
    pub grant_config: Option<GrantConfig>,

    /// 相对于父骨骼绑定位置的偏移（构建模型时计算）
    pub(crate) body_shift: Vec3,
}

impl BoneLink {
    /// 创建新骨骼
    pub fn new(name: impl Into<String>, initial_position: Vec3, parent_index: i32) -> Self {
        Self {
            name: name.into(),
            parent_index,
            transform_level: 0,
            flags: BoneFlags::ROTATABLE,
            initial_position,
            tail_index: -1,
            ik_config: None,
            grant_config: None,
            body_shift: initial_position,
        }
    }

    /// 设置变换层级
    pub fn with_level(mut self, level: i32) -> Self {
        self.transform_level = level;
        self
    }

    /// 设置 IK 链
    pub fn with_ik(mut self, ik: IkConfig) -> Self {
        self.flags.insert(BoneFlags::IK);
        self.ik_config = Some(ik);
        self
    }

    /// 设置付与
    pub fn with_grant(mut self, parent: i32, rate: f32, kind: GrantKind) -> Self {
        self.flags.set(BoneFlags::GRANT_ROTATE, kind.rotates());
        self.flags.set(BoneFlags::GRANT_TRANSLATE, kind.translates());
        self.grant_config = Some(GrantConfig { parent, rate, kind });
        self
    }

    /// 父骨骼索引
    #[inline]
    pub fn parent_id(&self) -> Option<usize> {
        if self.parent_index >= 0 {
            Some(self.parent_index as usize)
        } else {
            None
        }
    }

    /// 是否为根骨骼
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent_index < 0
    }

    /// 骨骼偏移（相对父骨骼绑定位置）
    #[inline]
    pub fn bone_offset(&self) -> Vec3 {
        self.body_shift
    }

    #[inline]
    pub fn is_ik(&self) -> bool {
        self.flags.contains(BoneFlags::IK) && self.ik_config.is_some()
    }

    #[inline]
    pub fn is_grant_rotate(&self) -> bool {
        self.flags.contains(BoneFlags::GRANT_ROTATE)
    }

    #[inline]
    pub fn is_grant_translate(&self) -> bool {
        self.flags.contains(BoneFlags::GRANT_TRANSLATE)
    }
}

impl Default for BoneLink {
    fn default() -> Self {
        Self::new(String::new(), Vec3::ZERO, -1)
    }
}
