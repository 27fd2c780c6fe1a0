//! 单个角色的运行上下文
//!
//! 持有一个骨骼模型、一个骨骼求解器和（可选）一个物理世界。
//! 每帧：应用姿态 → FK / 付与 / IK → 物理步进并回写 → 蒙皮矩阵。
//! 多个角色各自持有状态，互不干扰。

use glam::{Mat4, Quat, Vec3};

use crate::physics::{JointDef, MMDPhysics, PhysicsConfig, RigidBodyDef};
use crate::skeleton::{BonePose, RigSolver, SkeletonModel};
use crate::{Result, RigError};

pub struct Character {
    model: SkeletonModel,
    solver: RigSolver,
    physics: Option<MMDPhysics>,
    physics_enabled: bool,
    /// 最近一次传入的模型世界变换
    model_transform: Mat4,
}

impl Character {
    /// 仅骨骼，无物理
    pub fn new(model: SkeletonModel) -> Self {
        let mut solver = RigSolver::new(&model);
        solver.update_matrices(&model, false);
        Self {
            model,
            solver,
            physics: None,
            physics_enabled: false,
            model_transform: Mat4::IDENTITY,
        }
    }

    /// 骨骼 + 物理世界
    pub fn with_physics(
        model: SkeletonModel,
        bodies: &[RigidBodyDef],
        joints: &[JointDef],
        config: PhysicsConfig,
    ) -> Result<Self> {
        let mut character = Self::new(model);
        let mut physics = MMDPhysics::with_config(config)?;
        physics.build(&character.model, &character.solver, bodies, joints);
        character.physics = Some(physics);
        character.physics_enabled = true;
        Ok(character)
    }

    /// 推进一帧
    pub fn update(&mut self, pose: &BonePose, dt: f32) {
        self.solver.apply_pose(&self.model, pose);
        self.solver.update_matrices(&self.model, true);

        if !self.physics_enabled {
            return;
        }
        if let Some(physics) = self.physics.as_mut() {
            physics.step(dt, &self.model, &mut self.solver);
        }
    }

    /// 设置模型世界变换（用于惯性）
    pub fn set_model_transform(&mut self, transform: Mat4, dt: f32) {
        if !transform.is_finite() {
            log::debug!("忽略非有限的模型变换");
            return;
        }
        self.model_transform = transform;
        if !self.physics_enabled {
            return;
        }
        if let Some(physics) = self.physics.as_mut() {
            physics.apply_model_motion(transform, dt);
        }
    }

    #[inline]
    pub fn model_transform(&self) -> Mat4 {
        self.model_transform
    }

    /// 直接设置某根骨骼的本地姿态（平移不含绑定偏移）
    pub fn set_bone_local_pose_by_name(
        &mut self,
        name: &str,
        translation: Vec3,
        rotation: Quat,
    ) -> Result<()> {
        let index = self
            .model
            .find_bone(name)
            .ok_or_else(|| RigError::BoneNotFound(name.to_string()))?;
        if !self.solver.set_local_pose(&self.model, index, translation, rotation) {
            log::debug!("骨骼 '{}' 的本地姿态无效，忽略", name);
        } else {
            self.solver.update_skinning_matrices();
        }
        Ok(())
    }

    /// 物理回到当前骨骼姿态，同时清除 IK 的跨帧状态
    pub fn reset_physics(&mut self) {
        self.solver.reset_ik_state();
        if let Some(physics) = self.physics.as_mut() {
            physics.reset(&self.model, &self.solver);
        }
    }

    /// 开关物理；重新开启时先重置，避免刚体从旧位置弹回
    pub fn set_physics_enabled(&mut self, enabled: bool) {
        if enabled && !self.physics_enabled {
            self.reset_physics();
        }
        self.physics_enabled = enabled;
    }

    #[inline]
    pub fn is_physics_enabled(&self) -> bool {
        self.physics_enabled && self.physics.is_some()
    }

    /// 通知模型结构变化，求解器与物理在下一次调用时重建
    pub fn bump_revision(&mut self) {
        self.model.bump_revision();
    }

    // ========================================================================
    // 查询
    // ========================================================================

    #[inline]
    pub fn model(&self) -> &SkeletonModel {
        &self.model
    }

    #[inline]
    pub fn solver(&self) -> &RigSolver {
        &self.solver
    }

    #[inline]
    pub fn solver_mut(&mut self) -> &mut RigSolver {
        &mut self.solver
    }

    #[inline]
    pub fn physics(&self) -> Option<&MMDPhysics> {
        self.physics.as_ref()
    }

    #[inline]
    pub fn physics_mut(&mut self) -> Option<&mut MMDPhysics> {
        self.physics.as_mut()
    }

    #[inline]
    pub fn skinning_matrices(&self) -> &[Mat4] {
        self.solver.skinning_matrices()
    }

    pub fn global_matrix_by_name(&self, name: &str) -> Option<Mat4> {
        self.solver.global_matrix_by_name(&self.model, name)
    }

    pub fn local_matrix_by_name(&self, name: &str) -> Option<Mat4> {
        self.solver.local_matrix_by_name(&self.model, name)
    }

    /// 骨骼包围盒（模型空间）
    pub fn bounding_box(&self) -> Option<(Vec3, Vec3)> {
        self.solver.bounding_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::{BodyMode, RigidBodyShape};
    use crate::skeleton::BoneLink;
    use std::f32::consts::FRAC_PI_2;

    fn model() -> SkeletonModel {
        SkeletonModel::new(vec![
            BoneLink::new("root", Vec3::new(0.0, 10.0, 0.0), -1),
            BoneLink::new("hair", Vec3::new(0.0, 10.0, 0.0), 0),
        ])
    }

    fn defs() -> (Vec<RigidBodyDef>, Vec<JointDef>) {
        let head = RigidBodyDef::new(
            "head",
            0,
            RigidBodyShape::Sphere,
            Vec3::splat(0.2),
            Vec3::new(0.0, 10.0, 0.0),
            BodyMode::FollowBone,
        );
        let hair = RigidBodyDef::new(
            "hair",
            1,
            RigidBodyShape::Capsule,
            Vec3::new(0.2, 1.2, 0.0),
            Vec3::new(0.0, 10.0, -1.0),
            BodyMode::Physics,
        )
        .with_rotation(Vec3::new(FRAC_PI_2, 0.0, 0.0))
        .with_after_animation(true);
        let joint = JointDef::new("hinge", 0, 1, Vec3::new(0.0, 10.0, 0.0))
            .with_rotation_limits(Vec3::new(-FRAC_PI_2, 0.0, 0.0), Vec3::ZERO);
        (vec![head, hair], vec![joint])
    }

    fn config() -> PhysicsConfig {
        PhysicsConfig {
            gravity: Vec3::new(0.0, -9.8, 0.0),
            ..PhysicsConfig::default()
        }
    }

    #[test]
    fn test_identity_pose_is_bind_pose() {
        let mut character = Character::new(model());
        character.update(&BonePose::new(), 1.0 / 60.0);
        for m in character.skinning_matrices() {
            assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        }
        let (lo, hi) = character.bounding_box().unwrap();
        assert_eq!(lo, hi);
    }

    #[test]
    fn test_unknown_bone_is_error() {
        let mut character = Character::new(model());
        let err = character.set_bone_local_pose_by_name("tail", Vec3::ZERO, Quat::IDENTITY);
        assert!(matches!(err, Err(RigError::BoneNotFound(name)) if name == "tail"));
        assert!(character
            .set_bone_local_pose_by_name("hair", Vec3::ZERO, Quat::from_rotation_x(0.3))
            .is_ok());
    }

    #[test]
    fn test_physics_drives_hair_and_sleeps() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (bodies, joints) = defs();
        let mut character = Character::with_physics(model(), &bodies, &joints, config()).unwrap();
        let pose = BonePose::new();
        for _ in 0..300 {
            character.update(&pose, 1.0 / 60.0);
        }
        let physics = character.physics().unwrap();
        assert!(physics.is_sleeping());

        let hair = character.global_matrix_by_name("hair").unwrap();
        assert!(hair.transform_vector3(Vec3::NEG_Z).y < -0.9);

        // 休眠后输出逐位一致
        let snapshot = character.skinning_matrices().to_vec();
        character.update(&pose, 1.0 / 60.0);
        assert_eq!(character.skinning_matrices(), snapshot.as_slice());
    }

    #[test]
    fn test_disabled_physics_leaves_pose() {
        let (bodies, joints) = defs();
        let mut character = Character::with_physics(model(), &bodies, &joints, config()).unwrap();
        character.set_physics_enabled(false);
        for _ in 0..30 {
            character.update(&BonePose::new(), 1.0 / 60.0);
        }
        let hair = character.global_matrix_by_name("hair").unwrap();
        assert!(hair.abs_diff_eq(Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0)), 1e-5));
        assert!(!character.is_physics_enabled());
    }

    #[test]
    fn test_independent_characters() {
        let (bodies, joints) = defs();
        let mut a = Character::with_physics(model(), &bodies, &joints, config()).unwrap();
        let mut b = Character::with_physics(model(), &bodies, &joints, config()).unwrap();
        b.physics_mut().unwrap().set_gravity(Vec3::ZERO);

        for _ in 0..30 {
            a.update(&BonePose::new(), 1.0 / 60.0);
            b.update(&BonePose::new(), 1.0 / 60.0);
        }
        let rest = Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0));
        assert!(!a.global_matrix_by_name("hair").unwrap().abs_diff_eq(rest, 1e-3));
        assert!(b.global_matrix_by_name("hair").unwrap().abs_diff_eq(rest, 1e-3));
    }
}
