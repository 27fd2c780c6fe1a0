//! 物理系统
//!
//! 纯 Rust 实现的 XPBD 风格二次物理：
//! - 刚体：球 / 长方体 / 胶囊，统一用胶囊代理做细检测
//! - 关节：6DOF 弹簧关节（欧拉角限制 + 锚点位置约束）
//! - 碰撞：扫描剪枝 + 碰撞组过滤 + 柔度穿透修正
//! - 回写：按依赖顺序把动态刚体变换写回骨骼本地姿态
//!
//! 物理在模型局部空间运行，角色整体移动通过惯性速度传入。

pub mod config;

mod auto_collider;
mod collision;
mod definition;
mod joint;
mod mmd_physics;
mod rigid_body;
mod write_back;

pub use collision::{groups_collide, infer_group_semantics};
pub use config::{
    get_config, reset_config, set_config, AutoColliderPolicy, GroupMaskMode, GroupMaskSemantics,
    PhysicsConfig, WriteBackPolicy,
};
pub use definition::{BodyMode, JointDef, RigidBodyDef, RigidBodyShape};
pub use joint::JointConstraint;
pub use mmd_physics::MMDPhysics;
pub use rigid_body::Body;
