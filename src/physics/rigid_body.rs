//! 运行时刚体
//!
//! 所有形状统一为"胶囊代理"：一条本地长轴上的线段 + 半径。
//! 球体的线段长度为 0；长方体取最长半尺寸为半高、其余两轴平均为半径，
//! 同时保留原始半尺寸，供长方体之间的 SAT 检测使用。

use glam::{Mat4, Quat, Vec3};

use crate::math::{integrate_rotation, quat_from_rotation_vector};

use super::config::PhysicsConfig;
use super::definition::{BodyMode, RigidBodyDef, RigidBodyShape};

/// 运行时刚体
#[derive(Debug, Clone)]
pub struct Body {
    pub name: String,
    /// 关联骨骼
    pub bone_index: Option<usize>,
    pub mode: BodyMode,
    pub shape: RigidBodyShape,

    // ========== 胶囊代理 ==========
    /// 本地长轴 (0 = X, 1 = Y, 2 = Z)
    pub axis: usize,
    pub half_height: f32,
    pub radius: f32,
    /// 长方体半尺寸
    pub half_extents: Vec3,

    // ========== 绑定 ==========
    /// 骨骼 → 刚体的本地偏移（body = bone_global * bone_offset）
    pub bone_offset: Mat4,
    pub inv_bone_offset: Mat4,
    /// 绑定姿态世界变换
    pub bind_transform: Mat4,

    // ========== 材质 ==========
    pub inv_mass: f32,
    pub inv_inertia: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub friction: f32,
    /// 反弹系数，随模型数据保留；位置求解只消除穿透，不做反弹
    pub restitution: f32,
    pub group: u8,
    pub group_mask: u16,

    // ========== 回写策略 ==========
    pub after_animation: bool,
    pub keep_translation: bool,
    /// 自动生成的被动碰撞体
    pub auto_generated: bool,

    // ========== 状态 ==========
    pub position: Vec3,
    pub rotation: Quat,
    pub prev_position: Vec3,
    pub prev_rotation: Quat,
    pub start_position: Vec3,
    pub start_rotation: Quat,
    pub target_position: Vec3,
    pub target_rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub(crate) integrated_linear: Vec3,
    pub(crate) integrated_angular: Vec3,
}

impl Body {
    /// 从定义创建刚体
    ///
    /// `bone_bind` 为骨骼绑定姿态的全局矩阵（无骨骼时为 None）。
    pub fn from_def(
        def: &RigidBodyDef,
        bone_index: Option<usize>,
        bone_bind: Option<Mat4>,
        config: &PhysicsConfig,
    ) -> Self {
        let (axis, half_height, radius, half_extents) = capsule_proxy(def.shape, def.size);

        let bind_transform = def.bind_transform();
        let bone_offset = match bone_bind {
            Some(bone) => bone.inverse() * bind_transform,
            None => bind_transform,
        };
        let bone_offset = if bone_offset.is_finite() { bone_offset } else { Mat4::IDENTITY };
        let inv_bone_offset = bone_offset.inverse();

        // 质量：非静态且质量为正时才是动态刚体
        let mass = def.mass * config.mass_scale;
        let dynamic = def.mode != BodyMode::FollowBone && mass > 0.0 && mass.is_finite();
        let (inv_mass, inv_inertia) = if dynamic {
            let effective_radius = (radius + half_height).max(1.0e-3);
            let inertia = 0.4 * mass * effective_radius * effective_radius;
            (
                (1.0 / mass).min(config.max_inv_mass),
                (1.0 / inertia).min(config.max_inv_inertia),
            )
        } else {
            (0.0, 0.0)
        };

        let (position, rotation) = split(bind_transform);

        Self {
            name: def.name.clone(),
            bone_index,
            mode: def.mode,
            shape: def.shape,
            axis,
            half_height,
            radius,
            half_extents,
            bone_offset,
            inv_bone_offset,
            bind_transform,
            inv_mass,
            inv_inertia,
            linear_damping: (def.linear_damping * config.linear_damping_scale).clamp(0.0, 1.0),
            angular_damping: (def.angular_damping * config.angular_damping_scale).clamp(0.0, 1.0),
            friction: def.friction.max(0.0),
            restitution: def.restitution.clamp(0.0, 1.0),
            group: def.group.min(15),
            group_mask: def.group_mask,
            after_animation: def.after_animation,
            keep_translation: def.keep_translation,
            auto_generated: false,
            position,
            rotation,
            prev_position: position,
            prev_rotation: rotation,
            start_position: position,
            start_rotation: rotation,
            target_position: position,
            target_rotation: rotation,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            integrated_linear: Vec3::ZERO,
            integrated_angular: Vec3::ZERO,
        }
    }

    /// 动态刚体（参与积分与约束修正）
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.mode != BodyMode::FollowBone && self.inv_mass > 0.0
    }

    #[inline]
    pub fn transform(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    /// 放置到指定变换并清零速度
    pub fn teleport(&mut self, transform: Mat4) {
        let (position, rotation) = split(transform);
        if !position.is_finite() || !rotation.is_finite() {
            return;
        }
        self.position = position;
        self.rotation = rotation;
        self.prev_position = position;
        self.prev_rotation = rotation;
        self.start_position = position;
        self.start_rotation = rotation;
        self.target_position = position;
        self.target_rotation = rotation;
        self.linear_velocity = Vec3::ZERO;
        self.angular_velocity = Vec3::ZERO;
        self.integrated_linear = Vec3::ZERO;
        self.integrated_angular = Vec3::ZERO;
    }

    /// 世界空间长轴方向
    #[inline]
    pub fn world_axis(&self) -> Vec3 {
        self.rotation * unit_axis(self.axis)
    }

    /// 胶囊线段端点（世界空间）
    pub fn segment(&self) -> (Vec3, Vec3) {
        let half = self.world_axis() * self.half_height;
        (self.position - half, self.position + half)
    }

    /// 包围球半径
    pub fn bounding_radius(&self) -> f32 {
        match self.shape {
            RigidBodyShape::Box => self.half_extents.length().max(self.radius + self.half_height),
            _ => self.radius + self.half_height,
        }
    }

    /// 约束求解用的逆质量（非动态刚体为 0）
    #[inline]
    pub fn effective_inv_mass(&self) -> f32 {
        if self.is_dynamic() {
            self.inv_mass
        } else {
            0.0
        }
    }

    #[inline]
    pub fn effective_inv_inertia(&self) -> f32 {
        if self.is_dynamic() {
            self.inv_inertia
        } else {
            0.0
        }
    }

    /// 沿 n 在偏移 r 处的广义逆质量
    #[inline]
    pub fn generalized_inv_mass(&self, r: Vec3, n: Vec3) -> f32 {
        let rn = r.cross(n);
        self.effective_inv_mass() + self.effective_inv_inertia() * rn.length_squared()
    }

    /// 在偏移 r 处施加位置冲量 p（已按上限钳制）
    pub fn apply_correction(&mut self, p: Vec3, r: Vec3, max_linear: f32, max_angular: f32) {
        if !self.is_dynamic() {
            return;
        }
        let dx = clamp_length(p * self.inv_mass, max_linear);
        let dtheta = clamp_length(r.cross(p) * self.inv_inertia, max_angular);
        if !dx.is_finite() || !dtheta.is_finite() {
            return;
        }
        self.position += dx;
        self.rotation = (quat_from_rotation_vector(dtheta) * self.rotation).normalize();
    }

    /// 施加世界空间旋转修正（旋转向量）
    pub fn apply_rotation(&mut self, dtheta: Vec3) {
        if !self.is_dynamic() || !dtheta.is_finite() {
            return;
        }
        self.rotation = (quat_from_rotation_vector(dtheta) * self.rotation).normalize();
    }

    /// 半隐式积分
    pub fn integrate(&mut self, gravity: Vec3, h: f32) {
        if !self.is_dynamic() {
            return;
        }
        self.linear_velocity += gravity * h;
        self.integrated_linear = self.linear_velocity;
        self.integrated_angular = self.angular_velocity;
        self.position += self.linear_velocity * h;
        self.rotation = integrate_rotation(self.rotation, self.angular_velocity, h);
    }

    /// 是否低于休眠阈值
    #[inline]
    pub fn is_quiet(&self, linear_threshold: f32, angular_threshold: f32) -> bool {
        self.linear_velocity.length() < linear_threshold
            && self.angular_velocity.length() < angular_threshold
    }
}

/// 形状 → 胶囊代理 (长轴, 半高, 半径, 长方体半尺寸)
pub(crate) fn capsule_proxy(shape: RigidBodyShape, size: Vec3) -> (usize, f32, f32, Vec3) {
    let size = size.abs();
    match shape {
        RigidBodyShape::Sphere => (1, 0.0, size.x.max(1.0e-3), Vec3::splat(size.x)),
        RigidBodyShape::Capsule => {
            let radius = size.x.max(1.0e-3);
            let half_height = size.y * 0.5;
            (1, half_height, radius, Vec3::new(radius, half_height + radius, radius))
        }
        RigidBodyShape::Box => {
            let e = size.to_array();
            let mut axis = 0;
            for i in 1..3 {
                if e[i] > e[axis] {
                    axis = i;
                }
            }
            let others: f32 = (0..3).filter(|&i| i != axis).map(|i| e[i]).sum();
            let radius = (others * 0.5).max(1.0e-3);
            (axis, e[axis], radius, size)
        }
    }
}

#[inline]
pub(crate) fn unit_axis(index: usize) -> Vec3 {
    match index {
        0 => Vec3::X,
        1 => Vec3::Y,
        _ => Vec3::Z,
    }
}

#[inline]
pub(crate) fn clamp_length(v: Vec3, max: f32) -> Vec3 {
    let len_sq = v.length_squared();
    if len_sq > max * max {
        v * (max / len_sq.sqrt())
    } else {
        v
    }
}

/// 变换分解为 (位置, 旋转)
#[inline]
pub(crate) fn split(m: Mat4) -> (Vec3, Quat) {
    let (_, rotation, translation) = m.to_scale_rotation_translation();
    (translation, rotation.normalize())
}
