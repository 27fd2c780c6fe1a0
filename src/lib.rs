//! MMD Rig - 骨骼求解与二次物理核心
//!
//! 提供：
//! - 骨骼模型（静态层级、付与、IK 链元数据）
//! - 骨骼求解器（FK、付与传播、多链 CCD IK、蒙皮矩阵）
//! - 物理世界（刚体 + 关节，XPBD 风格求解，写回骨骼）
//! - Character 上下文（单个角色的完整每帧流程）
//!
//! 模型/动作文件解析、关键帧插值、渲染均不在本 crate 内。

pub mod character;
pub mod math;
pub mod physics;
pub mod skeleton;

pub use character::Character;
pub use physics::{
    AutoColliderPolicy, Body, BodyMode, GroupMaskMode, GroupMaskSemantics, JointConstraint,
    JointDef, MMDPhysics, PhysicsConfig, RigidBodyDef, RigidBodyShape, WriteBackPolicy,
};
pub use skeleton::{
    AngleUnit, BoneFlags, BoneLink, BonePose, BoneState, BoneTransform, GrantConfig, GrantKind,
    IkConfig, IkLink, RigConfig, RigSolver, SkeletonModel,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Bone not found: {0}")]
    BoneNotFound(String),
}

pub type Result<T> = std::result::Result<T, RigError>;
