//! 刚体 / 关节定义 - 模型加载器提供的只读数据
//!
//! 字段布局与 PMX 一致：位置为模型空间绑定位置，旋转为 YXZ 欧拉角（弧度）。

use glam::{EulerRot, Mat4, Quat, Vec3};

/// 刚体形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigidBodyShape {
    /// size.x = 半径
    Sphere,
    /// size = 半尺寸
    Box,
    /// size.x = 半径，size.y = 圆柱部分高度（沿本地 Y 轴）
    Capsule,
}

/// 刚体物理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// 跟随骨骼（运动学）
    FollowBone,
    /// 物理驱动
    Physics,
    /// 物理驱动，位置仍跟随骨骼
    PhysicsWithBone,
}

/// 刚体定义
#[derive(Debug, Clone)]
pub struct RigidBodyDef {
    pub name: String,
    /// 关联骨骼索引 (-1 表示无)
    pub bone_index: i32,
    /// 碰撞组 (0-15)
    pub group: u8,
    /// 碰撞组掩码，语义见 `GroupMaskMode`
    pub group_mask: u16,
    pub shape: RigidBodyShape,
    pub size: Vec3,
    pub position: Vec3,
    pub rotation: Vec3,
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    pub mode: BodyMode,
    /// 动画之后解算（参与回写）
    pub after_animation: bool,
    /// 回写时保留骨骼原本的本地平移（只回写旋转）
    pub keep_translation: bool,
}

impl RigidBodyDef {
    /// 创建刚体定义；`PhysicsWithBone` 模式默认只回写旋转
    pub fn new(
        name: impl Into<String>,
        bone_index: i32,
        shape: RigidBodyShape,
        size: Vec3,
        position: Vec3,
        mode: BodyMode,
    ) -> Self {
        Self {
            name: name.into(),
            bone_index,
            group: 0,
            group_mask: 0,
            shape,
            size,
            position,
            rotation: Vec3::ZERO,
            mass: 1.0,
            linear_damping: 0.5,
            angular_damping: 0.5,
            restitution: 0.0,
            friction: 0.5,
            mode,
            after_animation: false,
            keep_translation: mode == BodyMode::PhysicsWithBone,
        }
    }

    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_mass(mut self, mass: f32) -> Self {
        self.mass = mass;
        self
    }

    pub fn with_damping(mut self, linear: f32, angular: f32) -> Self {
        self.linear_damping = linear;
        self.angular_damping = angular;
        self
    }

    pub fn with_group(mut self, group: u8, group_mask: u16) -> Self {
        self.group = group;
        self.group_mask = group_mask;
        self
    }

    pub fn with_after_animation(mut self, after_animation: bool) -> Self {
        self.after_animation = after_animation;
        self
    }

    pub fn with_keep_translation(mut self, keep_translation: bool) -> Self {
        self.keep_translation = keep_translation;
        self
    }

    /// 绑定姿态下的世界变换
    pub fn bind_transform(&self) -> Mat4 {
        Mat4::from_rotation_translation(euler_yxz(self.rotation), self.position)
    }
}

/// 关节定义（6DOF 弹簧）
#[derive(Debug, Clone)]
pub struct JointDef {
    pub name: String,
    pub body_a: i32,
    pub body_b: i32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub position_min: Vec3,
    pub position_max: Vec3,
    pub rotation_min: Vec3,
    pub rotation_max: Vec3,
    pub position_spring: Vec3,
    pub rotation_spring: Vec3,
}

impl JointDef {
    /// 创建关节定义（默认完全锁定）
    pub fn new(name: impl Into<String>, body_a: i32, body_b: i32, position: Vec3) -> Self {
        Self {
            name: name.into(),
            body_a,
            body_b,
            position,
            rotation: Vec3::ZERO,
            position_min: Vec3::ZERO,
            position_max: Vec3::ZERO,
            rotation_min: Vec3::ZERO,
            rotation_max: Vec3::ZERO,
            position_spring: Vec3::ZERO,
            rotation_spring: Vec3::ZERO,
        }
    }

    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_rotation_limits(mut self, min: Vec3, max: Vec3) -> Self {
        self.rotation_min = min;
        self.rotation_max = max;
        self
    }

    pub fn with_position_limits(mut self, min: Vec3, max: Vec3) -> Self {
        self.position_min = min;
        self.position_max = max;
        self
    }

    pub fn with_springs(mut self, position: Vec3, rotation: Vec3) -> Self {
        self.position_spring = position;
        self.rotation_spring = rotation;
        self
    }

    /// 关节在绑定姿态下的世界坐标系
    pub fn bind_frame(&self) -> (Vec3, Quat) {
        (self.position, euler_yxz(self.rotation))
    }
}

/// PMX 欧拉角（X, Y, Z 分量，按 Y-X-Z 顺序组合）
#[inline]
pub(crate) fn euler_yxz(e: Vec3) -> Quat {
    Quat::from_euler(EulerRot::YXZ, e.y, e.x, e.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physics_with_bone_keeps_translation_by_default() {
        let def = RigidBodyDef::new(
            "skirt",
            3,
            RigidBodyShape::Box,
            Vec3::ONE,
            Vec3::ZERO,
            BodyMode::PhysicsWithBone,
        );
        assert!(def.keep_translation);
        let def = def.with_keep_translation(false);
        assert!(!def.keep_translation);
    }

    #[test]
    fn test_bind_transform_rotation_order() {
        let shape = RigidBodyShape::Sphere;
        let def = RigidBodyDef::new("a", 0, shape, Vec3::ONE, Vec3::Y, BodyMode::Physics)
            .with_rotation(Vec3::new(0.0, std::f32::consts::FRAC_PI_2, 0.0));
        let m = def.bind_transform();
        let x = m.transform_vector3(Vec3::X);
        assert!((x - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-5);
        assert!((m.w_axis.truncate() - Vec3::Y).length() < 1e-6);
    }
}
