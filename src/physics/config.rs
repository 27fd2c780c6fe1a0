//! MMD 物理配置
//!
//! 所有参数扁平化。全局实例只作为新建物理世界的默认模板：
//! 每个世界构建时复制一份，之后不再读取全局配置。

use glam::Vec3;
use once_cell::sync::Lazy;
use std::sync::RwLock;

use crate::{Result, RigError};

/// 碰撞组掩码位的含义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMaskSemantics {
    /// 掩码位为 1 表示与该组碰撞
    CollideWith,
    /// 掩码位为 1 表示忽略该组（PMX 非碰撞组标志）
    Ignore,
}

/// 碰撞组语义来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupMaskMode {
    /// 构建时根据掩码统计推断（兼容旧数据）
    #[default]
    Infer,
    /// 显式指定
    Explicit(GroupMaskSemantics),
}

/// 回写策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteBackPolicy {
    /// 只回写标记为"动画后解算"的刚体；模型中没有任何此类刚体时，
    /// 只回写"物理 + 骨骼位置"模式的刚体
    #[default]
    AfterAnimationFlag,
    /// 回写全部动态刚体
    AllDynamic,
}

/// 自动碰撞体生成策略
#[derive(Debug, Clone)]
pub struct AutoColliderPolicy {
    /// 是否生成，默认 false
    pub enabled: bool,
    /// 最多生成多少个，默认 32
    pub max_count: usize,
    /// 半径 = 骨骼边长 * radius_ratio，默认 0.18
    pub radius_ratio: f32,
    /// 半径上限，默认 1.5
    pub max_radius: f32,
    /// 短于此长度的骨骼边跳过，默认 0.5
    pub min_length: f32,
    /// 碰撞组，默认 15
    pub group: u8,
}

impl Default for AutoColliderPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_count: 32,
            radius_ratio: 0.18,
            max_radius: 1.5,
            min_length: 0.5,
            group: 15,
        }
    }
}

/// 物理配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    // ========== 重力 ==========
    /// 重力向量，默认 (0, -98, 0)（MMD 标准）
    pub gravity: Vec3,

    // ========== 模拟参数 ==========
    /// 物理 FPS（固定步长 = 1 / physics_fps），默认 60.0
    pub physics_fps: f32,
    /// 每次调用最多追赶的固定步数，多余时间直接丢弃，默认 5
    pub max_catch_up_steps: u32,
    /// 每个固定步的子步数，默认 2
    pub substeps: u32,
    /// 关节求解迭代次数，默认 8
    pub solver_iterations: u32,
    /// 碰撞求解迭代次数，默认 2
    pub collision_iterations: u32,

    // ========== XPBD ==========
    /// 关节位置柔度（α，实际使用 α / h²），默认 1e-7
    pub joint_compliance: f32,
    /// 接触柔度，默认 1e-6
    pub contact_compliance: f32,
    /// 每个子步开始时关节累计冲量的衰减系数，默认 0.8
    pub warm_start_decay: f32,
    /// 超限时每次迭代拉回的比例（最后一次迭代完全拉回），默认 0.5
    pub limit_correction: f32,
    /// 弹簧回正的单次迭代角度上限（弧度），默认 0.2
    pub spring_relax_cap: f32,
    /// 单次位置修正上限，默认 1.0
    pub max_position_correction: f32,
    /// 单次角度修正上限（弧度），默认 0.5
    pub max_angular_correction: f32,
    /// 速度 = blend * 位移速度 + (1 - blend) * 积分速度，默认 0.9
    pub velocity_blend: f32,

    // ========== 刚体参数缩放 ==========
    /// 线性阻尼缩放（乘以定义中的原值），默认 1.0
    pub linear_damping_scale: f32,
    /// 角速度阻尼缩放，默认 1.0
    pub angular_damping_scale: f32,
    /// 质量缩放，默认 1.0
    pub mass_scale: f32,
    /// 弹簧刚度缩放，默认 1.0
    pub spring_stiffness_scale: f32,
    /// 逆质量上限，默认 1000.0
    pub max_inv_mass: f32,
    /// 逆惯量上限，默认 1000.0
    pub max_inv_inertia: f32,

    // ========== 惯性效果 ==========
    /// 惯性效果强度，0.0 = 无惯性，1.0 = 正常，默认 1.0
    pub inertia_strength: f32,
    /// 模型移动速度上限，超出视为瞬移，默认 20.0
    pub max_model_speed: f32,

    // ========== 速度限制 ==========
    /// 最大线速度，默认 100.0
    pub max_linear_velocity: f32,
    /// 最大角速度（弧度/秒），默认 50.0
    pub max_angular_velocity: f32,

    // ========== 碰撞 ==========
    /// 碰撞边距，默认 0.02
    pub collision_margin: f32,
    /// 是否启用地面，默认 false
    pub ground_enabled: bool,
    /// 地面高度，默认 0.0
    pub ground_height: f32,
    /// 关节直接相连的刚体不碰撞，默认 true
    pub exclude_jointed_pairs: bool,
    /// 碰撞组掩码语义，默认推断
    pub group_mask_mode: GroupMaskMode,

    // ========== 休眠 ==========
    /// 线速度阈值，默认 0.05
    pub sleep_linear_threshold: f32,
    /// 角速度阈值，默认 0.05
    pub sleep_angular_threshold: f32,
    /// 连续多少个固定步低于阈值后进入休眠，0 表示从不休眠，默认 30
    pub sleep_steps: u32,

    // ========== 回写 / 自动碰撞体 ==========
    pub write_back_policy: WriteBackPolicy,
    pub auto_colliders: AutoColliderPolicy,

    // ========== 调试 ==========
    /// 是否启用关节，默认 true
    pub joints_enabled: bool,
    /// 是否输出调试日志，默认 false
    pub debug_log: bool,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            // ====== 重力 ======
            // 刚体的弹簧 / 质量 / 阻尼参数都是为此重力设计的
            gravity: Vec3::new(0.0, -98.0, 0.0),

            // ====== 模拟参数 ======
            physics_fps: 60.0,
            max_catch_up_steps: 5,
            substeps: 2,
            solver_iterations: 8,
            collision_iterations: 2,

            // ====== XPBD ======
            joint_compliance: 1.0e-7,
            contact_compliance: 1.0e-6,
            warm_start_decay: 0.8,
            limit_correction: 0.5,
            spring_relax_cap: 0.2,
            max_position_correction: 1.0,
            max_angular_correction: 0.5,
            velocity_blend: 0.9,

            // ====== 刚体参数 ======
            linear_damping_scale: 1.0,
            angular_damping_scale: 1.0,
            mass_scale: 1.0,
            spring_stiffness_scale: 1.0,
            max_inv_mass: 1000.0,
            max_inv_inertia: 1000.0,

            // ====== 惯性效果 ======
            inertia_strength: 1.0,
            max_model_speed: 20.0,

            // ====== 速度限制（适配 -98 重力）======
            max_linear_velocity: 100.0,
            max_angular_velocity: 50.0,

            // ====== 碰撞 ======
            collision_margin: 0.02,
            ground_enabled: false,
            ground_height: 0.0,
            exclude_jointed_pairs: true,
            group_mask_mode: GroupMaskMode::Infer,

            // ====== 休眠 ======
            sleep_linear_threshold: 0.05,
            sleep_angular_threshold: 0.05,
            sleep_steps: 30,

            write_back_policy: WriteBackPolicy::AfterAnimationFlag,
            auto_colliders: AutoColliderPolicy::default(),

            // ====== 调试 ======
            joints_enabled: true,
            debug_log: false,
        }
    }
}

impl PhysicsConfig {
    /// 固定步长
    #[inline]
    pub fn fixed_timestep(&self) -> f32 {
        1.0 / self.physics_fps
    }

    /// 检查配置合法性
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(RigError::InvalidConfig(msg))
        }

        if !(self.physics_fps > 0.0) || !self.physics_fps.is_finite() {
            return invalid(format!("physics_fps 必须为正数: {}", self.physics_fps));
        }
        if self.max_catch_up_steps == 0 || self.substeps == 0 {
            return invalid("max_catch_up_steps / substeps 至少为 1".to_string());
        }
        if self.solver_iterations == 0 {
            return invalid("solver_iterations 至少为 1".to_string());
        }
        if !self.gravity.is_finite() {
            return invalid(format!("重力非有限值: {:?}", self.gravity));
        }
        for (name, value) in [
            ("joint_compliance", self.joint_compliance),
            ("contact_compliance", self.contact_compliance),
            ("mass_scale", self.mass_scale),
            ("linear_damping_scale", self.linear_damping_scale),
            ("angular_damping_scale", self.angular_damping_scale),
            ("spring_stiffness_scale", self.spring_stiffness_scale),
            ("inertia_strength", self.inertia_strength),
            ("collision_margin", self.collision_margin),
            ("sleep_linear_threshold", self.sleep_linear_threshold),
            ("sleep_angular_threshold", self.sleep_angular_threshold),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return invalid(format!("{} 必须为非负数: {}", name, value));
            }
        }
        for (name, value) in [
            ("warm_start_decay", self.warm_start_decay),
            ("velocity_blend", self.velocity_blend),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} 必须在 [0, 1] 内: {}", name, value));
            }
        }
        for (name, value) in [
            ("limit_correction", self.limit_correction),
            ("spring_relax_cap", self.spring_relax_cap),
            ("max_position_correction", self.max_position_correction),
            ("max_angular_correction", self.max_angular_correction),
            ("max_inv_mass", self.max_inv_mass),
            ("max_inv_inertia", self.max_inv_inertia),
            ("max_linear_velocity", self.max_linear_velocity),
            ("max_angular_velocity", self.max_angular_velocity),
        ] {
            if !(value > 0.0) {
                return invalid(format!("{} 必须为正数: {}", name, value));
            }
        }
        if self.limit_correction > 1.0 {
            return invalid(format!("limit_correction 不能超过 1: {}", self.limit_correction));
        }
        Ok(())
    }
}

/// 默认配置模板
static PHYSICS_CONFIG: Lazy<RwLock<PhysicsConfig>> = Lazy::new(|| {
    RwLock::new(PhysicsConfig::default())
});

/// 获取当前默认模板（副本）
pub fn get_config() -> PhysicsConfig {
    PHYSICS_CONFIG.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 设置默认模板（只影响之后新建的物理世界）
pub fn set_config(config: PhysicsConfig) -> Result<()> {
    config.validate()?;
    *PHYSICS_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = config;
    Ok(())
}

/// 重置为默认配置
pub fn reset_config() {
    *PHYSICS_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = PhysicsConfig::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PhysicsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = PhysicsConfig {
            physics_fps: 0.0,
            ..PhysicsConfig::default()
        };
        assert!(matches!(config.validate(), Err(RigError::InvalidConfig(_))));

        let config = PhysicsConfig {
            warm_start_decay: 1.5,
            ..PhysicsConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PhysicsConfig {
            gravity: Vec3::new(0.0, f32::NAN, 0.0),
            ..PhysicsConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_config_rejects_invalid_template() {
        let bad = PhysicsConfig {
            substeps: 0,
            ..PhysicsConfig::default()
        };
        assert!(set_config(bad).is_err());
        assert_eq!(get_config().substeps, PhysicsConfig::default().substeps);
    }
}
