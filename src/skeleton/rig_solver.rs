//! 骨骼求解器 - FK / 付与 / IK / 蒙皮矩阵
//!
//! RigSolver 独占全部 BoneState。外部（物理回写、程序化动画）只能通过
//! `set_local_pose` 修改单根骨骼的本地姿态。

use glam::{Mat4, Quat, Vec3};
use rayon::prelude::*;

use crate::math::quat_pow;
use crate::{Result, RigError};

use super::ik_schedule::IkSchedule;
use super::ik_solver::IkSolver;
use super::model::SkeletonModel;
use super::{BonePose, BoneTransform};

// ============================================================================
// 骨骼状态
// ============================================================================

/// 每根骨骼的运行时状态
#[derive(Clone, Copy, Debug)]
pub struct BoneState {
    /// 动画平移（不含绑定偏移）
    pub(crate) translation: Vec3,
    /// 动画旋转
    pub(crate) rotation: Quat,
    /// IK 旋转
    pub(crate) ik_rotation: Quat,
    /// 付与平移
    pub(crate) grant_translation: Vec3,
    /// 付与旋转
    pub(crate) grant_rotation: Quat,
    pub(crate) local_matrix: Mat4,
    pub(crate) global_matrix: Mat4,
    /// 本帧已被 set_local_pose 覆盖
    pub(crate) pose_locked: bool,
}

impl Default for BoneState {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            ik_rotation: Quat::IDENTITY,
            grant_translation: Vec3::ZERO,
            grant_rotation: Quat::IDENTITY,
            local_matrix: Mat4::IDENTITY,
            global_matrix: Mat4::IDENTITY,
            pose_locked: false,
        }
    }
}

impl BoneState {
    #[inline]
    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    #[inline]
    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    #[inline]
    pub fn ik_rotation(&self) -> Quat {
        self.ik_rotation
    }

    #[inline]
    pub fn local_matrix(&self) -> Mat4 {
        self.local_matrix
    }

    #[inline]
    pub fn global_matrix(&self) -> Mat4 {
        self.global_matrix
    }

    /// 全局位置
    #[inline]
    pub fn position(&self) -> Vec3 {
        self.global_matrix.w_axis.truncate()
    }

    /// 最终本地旋转：IK * (动画 * 付与)
    #[inline]
    pub fn final_rotation(&self) -> Quat {
        (self.ik_rotation * (self.rotation * self.grant_rotation)).normalize()
    }
}

// ============================================================================
// 求解器配置
// ============================================================================

/// 骨骼求解器配置
#[derive(Clone, Debug)]
pub struct RigConfig {
    /// IK 收敛阈值（末端到目标距离的平方）
    pub ik_convergence_epsilon: f32,
    /// 铰链帧间限速（残差大于 hinge_near_distance 时），弧度
    pub hinge_rate_cap_far: f32,
    /// 铰链帧间限速（接近目标时），弧度
    pub hinge_rate_cap_near: f32,
    /// 区分远 / 近限速的残差距离
    pub hinge_near_distance: f32,
    /// 独立 IK 链并行求解
    pub parallel_ik: bool,
    /// 蒙皮矩阵并行计算
    pub parallel_skinning: bool,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            ik_convergence_epsilon: 1.0e-6,
            hinge_rate_cap_far: 0.5,
            hinge_rate_cap_near: 0.08,
            hinge_near_distance: 0.1,
            parallel_ik: true,
            parallel_skinning: true,
        }
    }
}

impl RigConfig {
    /// 检查配置合法性
    pub fn validate(&self) -> Result<()> {
        if !(self.ik_convergence_epsilon >= 0.0) {
            return Err(RigError::InvalidConfig(format!(
                "ik_convergence_epsilon 必须为非负数: {}",
                self.ik_convergence_epsilon
            )));
        }
        for (name, value) in [
            ("hinge_rate_cap_far", self.hinge_rate_cap_far),
            ("hinge_rate_cap_near", self.hinge_rate_cap_near),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(RigError::InvalidConfig(format!("{} 必须为正数: {}", name, value)));
            }
        }
        if !(self.hinge_near_distance >= 0.0) {
            return Err(RigError::InvalidConfig(format!(
                "hinge_near_distance 必须为非负数: {}",
                self.hinge_near_distance
            )));
        }
        Ok(())
    }
}

// ============================================================================
// 骨骼求解器
// ============================================================================

/// 骨骼求解器
pub struct RigSolver {
    config: RigConfig,
    states: Vec<BoneState>,
    inverse_bind: Vec<Mat4>,
    skinning: Vec<Mat4>,
    solvers: Vec<IkSolver>,
    schedule: IkSchedule,
    revision: u64,
}

impl RigSolver {
    /// 使用默认配置创建
    pub fn new(model: &SkeletonModel) -> Self {
        let mut solver = Self {
            config: RigConfig::default(),
            states: Vec::new(),
            inverse_bind: Vec::new(),
            skinning: Vec::new(),
            solvers: Vec::new(),
            schedule: IkSchedule::default(),
            revision: model.revision(),
        };
        solver.initialize(model);
        solver
    }

    pub fn with_config(model: &SkeletonModel, config: RigConfig) -> Result<Self> {
        config.validate()?;
        let mut solver = Self::new(model);
        solver.config = config;
        Ok(solver)
    }

    /// 分配 BoneState、计算绑定姿态及其逆矩阵、构建 IK 链与调度
    pub fn initialize(&mut self, model: &SkeletonModel) {
        let count = model.bone_count();
        self.states = vec![BoneState::default(); count];
        transform_pass(model, &mut self.states);

        self.inverse_bind = self
            .states
            .iter()
            .map(|s| {
                let inv = s.global_matrix.inverse();
                if inv.is_finite() {
                    inv
                } else {
                    Mat4::IDENTITY
                }
            })
            .collect();
        self.skinning = vec![Mat4::IDENTITY; count];

        self.solvers = model
            .ik_bones()
            .iter()
            .filter_map(|&b| IkSolver::new(model, b))
            .collect();
        self.schedule = IkSchedule::build(model, &self.solvers);
        self.revision = model.revision();

        log::info!(
            "骨骼求解器初始化: {} 根骨骼, {} 条 IK 链, {} 个 IK 阶段",
            count,
            self.solvers.len(),
            self.schedule.stages().len()
        );
    }

    /// 模型版本变化时整体重建
    pub fn ensure_revision(&mut self, model: &SkeletonModel) {
        if self.revision != model.revision() || self.states.len() != model.bone_count() {
            log::debug!("骨骼模型版本变化 ({} -> {})，重建求解器", self.revision, model.revision());
            self.initialize(model);
        }
    }

    #[inline]
    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RigConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    // ========================================================================
    // 每帧流程
    // ========================================================================

    /// 重置全部本地变换为单位，再按名称覆盖
    pub fn apply_pose(&mut self, model: &SkeletonModel, pose: &BonePose) {
        self.ensure_revision(model);

        for state in self.states.iter_mut() {
            state.translation = Vec3::ZERO;
            state.rotation = Quat::IDENTITY;
            state.ik_rotation = Quat::IDENTITY;
            state.pose_locked = false;
        }
        if pose.is_empty() {
            return;
        }

        for (name, translation) in &pose.translations {
            match model.find_bone(name) {
                Some(i) if translation.is_finite() => self.states[i].translation = *translation,
                Some(_) => log::debug!("骨骼 '{}' 的平移非有限值，忽略", name),
                None => log::debug!("姿态中的骨骼 '{}' 不存在，忽略", name),
            }
        }
        for (name, rotation) in &pose.rotations {
            match model.find_bone(name) {
                Some(i) if rotation.is_finite() && rotation.length_squared() > 1.0e-12 => {
                    self.states[i].rotation = rotation.normalize();
                }
                Some(_) => log::debug!("骨骼 '{}' 的旋转无效，忽略", name),
                None => log::debug!("姿态中的骨骼 '{}' 不存在，忽略", name),
            }
        }
    }

    /// FK（含付与），可选 IK，最后计算蒙皮矩阵
    pub fn update_matrices(&mut self, model: &SkeletonModel, solve_ik: bool) {
        self.ensure_revision(model);
        transform_pass(model, &mut self.states);
        if solve_ik && !self.solvers.is_empty() {
            self.solve_ik(model);
        }
        self.update_skinning_matrices();
    }

    /// 清除所有 IK 链的跨帧状态，下一帧单轴链接从 0 开始展开
    pub fn reset_ik_state(&mut self) {
        for solver in &mut self.solvers {
            solver.reset_state();
        }
    }

    /// 按调度逐阶段求解 IK；每个阶段结束后重新执行变换
    fn solve_ik(&mut self, model: &SkeletonModel) {
        let Self {
            config,
            states,
            solvers,
            schedule,
            ..
        } = self;

        for stage in schedule.stages() {
            let results: Vec<Vec<(usize, Quat)>> = if config.parallel_ik && stage.len() > 1 {
                let states: &[BoneState] = states;
                let config: &RigConfig = config;
                solvers
                    .par_iter_mut()
                    .enumerate()
                    .filter(|(i, _)| stage.binary_search(i).is_ok())
                    .map(|(_, solver)| solver.solve(model, states, config))
                    .collect()
            } else {
                stage
                    .iter()
                    .map(|&i| solvers[i].solve(model, states, config))
                    .collect()
            };

            for (bone, rotation) in results.into_iter().flatten() {
                states[bone].ik_rotation = rotation;
            }
            transform_pass(model, states);
        }
    }

    /// 蒙皮矩阵 = 当前全局 * 绑定逆矩阵
    pub fn update_skinning_matrices(&mut self) {
        let states = &self.states;
        let inverse_bind = &self.inverse_bind;
        if self.config.parallel_skinning {
            self.skinning
                .par_iter_mut()
                .zip(states.par_iter())
                .zip(inverse_bind.par_iter())
                .for_each(|((out, state), inv)| *out = state.global_matrix * *inv);
        } else {
            for ((out, state), inv) in self.skinning.iter_mut().zip(states).zip(inverse_bind) {
                *out = state.global_matrix * *inv;
            }
        }
    }

    /// 设置单根骨骼的本地姿态（平移不含绑定偏移），并更新其子树的全局矩阵
    ///
    /// 该骨骼本帧不再参与付与 / IK。非有限输入或无效索引时返回 false。
    pub fn set_local_pose(
        &mut self,
        model: &SkeletonModel,
        bone_index: usize,
        translation: Vec3,
        rotation: Quat,
    ) -> bool {
        self.ensure_revision(model);
        let Some(bone) = model.bone(bone_index) else {
            return false;
        };
        if !translation.is_finite()
            || !rotation.is_finite()
            || rotation.length_squared() < 1.0e-12
        {
            return false;
        }
        let rotation = rotation.normalize();
        let local = Mat4::from_rotation_translation(rotation, bone.bone_offset() + translation);
        let parent = bone
            .parent_id()
            .map(|p| self.states[p].global_matrix)
            .unwrap_or(Mat4::IDENTITY);
        let global = parent * local;
        if !global.is_finite() {
            return false;
        }

        let state = &mut self.states[bone_index];
        state.translation = translation;
        state.rotation = rotation;
        state.ik_rotation = Quat::IDENTITY;
        state.grant_translation = Vec3::ZERO;
        state.grant_rotation = Quat::IDENTITY;
        state.local_matrix = local;
        state.global_matrix = global;
        state.pose_locked = true;

        for child in model.subtree(bone_index).into_iter().skip(1) {
            if let Some(p) = model.bones()[child].parent_id() {
                let global = self.states[p].global_matrix * self.states[child].local_matrix;
                if global.is_finite() {
                    self.states[child].global_matrix = global;
                }
            }
        }
        true
    }

    /// 启用 / 禁用某根 IK 骨骼的链
    pub fn set_ik_enabled(&mut self, ik_bone: usize, enabled: bool) -> bool {
        match self.solvers.iter_mut().find(|s| s.bone_index == ik_bone) {
            Some(solver) => {
                solver.enabled = enabled;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // 查询
    // ========================================================================

    #[inline]
    pub fn bone_count(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub fn states(&self) -> &[BoneState] {
        &self.states
    }

    #[inline]
    pub fn state(&self, index: usize) -> Option<&BoneState> {
        self.states.get(index)
    }

    pub fn global_matrix(&self, index: usize) -> Option<Mat4> {
        self.states.get(index).map(|s| s.global_matrix)
    }

    pub fn local_matrix(&self, index: usize) -> Option<Mat4> {
        self.states.get(index).map(|s| s.local_matrix)
    }

    pub fn global_matrix_by_name(&self, model: &SkeletonModel, name: &str) -> Option<Mat4> {
        model.find_bone(name).and_then(|i| self.global_matrix(i))
    }

    pub fn local_matrix_by_name(&self, model: &SkeletonModel, name: &str) -> Option<Mat4> {
        model.find_bone(name).and_then(|i| self.local_matrix(i))
    }

    /// 骨骼全局位置
    pub fn bone_position(&self, index: usize) -> Option<Vec3> {
        self.states.get(index).map(BoneState::position)
    }

    /// 当前本地姿态（平移含付与，不含绑定偏移；旋转为最终旋转）
    pub fn local_pose(&self, index: usize) -> Option<BoneTransform> {
        self.states.get(index).map(|s| {
            BoneTransform::new(s.translation + s.grant_translation, s.final_rotation())
        })
    }

    #[inline]
    pub fn skinning_matrices(&self) -> &[Mat4] {
        &self.skinning
    }

    pub fn skinning_matrix(&self, index: usize) -> Option<Mat4> {
        self.skinning.get(index).copied()
    }

    /// 骨骼包围盒（全局位置）
    pub fn bounding_box(&self) -> Option<(Vec3, Vec3)> {
        let mut iter = self.states.iter().map(BoneState::position);
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p))))
    }

    #[inline]
    pub fn ik_solvers(&self) -> &[IkSolver] {
        &self.solvers
    }

    #[inline]
    pub fn ik_schedule(&self) -> &IkSchedule {
        &self.schedule
    }
}

// ============================================================================
// 变换计算
// ============================================================================

/// 按求值顺序计算付与、本地与全局矩阵
fn transform_pass(model: &SkeletonModel, states: &mut [BoneState]) {
    for &i in model.eval_order() {
        let bone = &model.bones()[i];

        if !states[i].pose_locked {
            let (grant_rotation, grant_translation) = grant_of(model, states, i);
            states[i].grant_rotation = grant_rotation;
            states[i].grant_translation = grant_translation;
        }

        let state = &states[i];
        let local = Mat4::from_rotation_translation(
            state.final_rotation(),
            bone.bone_offset() + state.translation + state.grant_translation,
        );
        let global = match bone.parent_id() {
            Some(p) => states[p].global_matrix * local,
            None => local,
        };

        if global.is_finite() {
            states[i].local_matrix = local;
            states[i].global_matrix = global;
        } else {
            log::debug!("骨骼 '{}' 的全局矩阵非有限值，保留上一次结果", bone.name);
        }
    }
}

/// 付与：按比率取付与父骨骼的旋转（四元数幂）与平移
fn grant_of(model: &SkeletonModel, states: &[BoneState], index: usize) -> (Quat, Vec3) {
    let bone = &model.bones()[index];
    let Some(grant) = bone.grant_config.as_ref() else {
        return (Quat::IDENTITY, Vec3::ZERO);
    };
    let Some(source) = model.resolve(grant.parent).filter(|&p| p != index) else {
        return (Quat::IDENTITY, Vec3::ZERO);
    };
    let source = &states[source];

    let rotation = if bone.is_grant_rotate() {
        quat_pow(source.final_rotation(), grant.rate)
    } else {
        Quat::IDENTITY
    };
    let translation = if bone.is_grant_translate() {
        (source.translation + source.grant_translation) * grant.rate
    } else {
        Vec3::ZERO
    };

    if rotation.is_finite() && translation.is_finite() {
        (rotation, translation)
    } else {
        (Quat::IDENTITY, Vec3::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{decompose_euler_xyz, twist_angle};
    use crate::skeleton::{BoneLink, GrantKind, IkConfig, IkLink};
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

    fn assert_vec3_near(a: Vec3, b: Vec3, tol: f32) {
        assert!((a - b).length() < tol, "{:?} != {:?}", a, b);
    }

    fn knee_hinge() -> IkLink {
        IkLink::limited(1, Vec3::ZERO, Vec3::new(150f32.to_radians(), 0.0, 0.0))
    }

    fn leg_model(iterations: u32) -> SkeletonModel {
        let ik = IkConfig {
            target_bone: 2,
            iterations,
            limit_angle: 1.0,
            links: vec![knee_hinge(), IkLink::free(0)],
        };
        SkeletonModel::with_angle_unit(
            vec![
                BoneLink::new("hip", Vec3::new(0.0, 10.0, 0.0), -1),
                BoneLink::new("knee", Vec3::new(0.0, 5.0, 0.0), 0),
                BoneLink::new("ankle", Vec3::new(0.0, 0.0, 0.0), 1),
                BoneLink::new("leg_ik", Vec3::new(0.0, 0.0, 0.0), -1).with_ik(ik),
            ],
            crate::skeleton::AngleUnit::Radians,
        )
    }

    fn two_leg_model() -> SkeletonModel {
        let mut bones = vec![BoneLink::new("center", Vec3::new(0.0, 10.0, 0.0), -1)];
        for (side, x) in [("L", 1.0f32), ("R", -1.0)] {
            let base = bones.len() as i32;
            bones.push(BoneLink::new(format!("hip_{side}"), Vec3::new(x, 10.0, 0.0), 0));
            bones.push(BoneLink::new(format!("knee_{side}"), Vec3::new(x, 5.0, 0.0), base));
            bones.push(BoneLink::new(format!("ankle_{side}"), Vec3::new(x, 0.0, 0.0), base + 1));
        }
        for (side, x, hip) in [("L", 1.0f32, 1), ("R", -1.0, 4)] {
            let ik = IkConfig {
                target_bone: hip + 2,
                iterations: 20,
                limit_angle: 1.0,
                links: vec![
                    IkLink::limited(hip + 1, Vec3::ZERO, Vec3::new(2.6, 0.0, 0.0)),
                    IkLink::free(hip),
                ],
            };
            bones.push(BoneLink::new(format!("ik_{side}"), Vec3::new(x, 0.0, 0.0), -1).with_ik(ik));
        }
        SkeletonModel::new(bones)
    }

    #[test]
    fn test_bind_pose_round_trip() {
        let model = two_leg_model();
        let mut solver = RigSolver::new(&model);
        solver.apply_pose(&model, &BonePose::new());
        solver.update_matrices(&model, false);
        for m in solver.skinning_matrices() {
            assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-5));
        }
        assert_vec3_near(solver.bone_position(3).unwrap(), Vec3::new(1.0, 0.0, 0.0), 1e-5);
    }

    #[test]
    fn test_bind_round_trip_with_parent_listed_after_child() {
        let model = SkeletonModel::new(vec![
            BoneLink::new("child", Vec3::new(0.0, 3.0, 0.0), 1),
            BoneLink::new("parent", Vec3::new(0.0, 1.0, 0.0), -1),
        ]);
        let mut solver = RigSolver::new(&model);
        solver.apply_pose(&model, &BonePose::new());
        solver.update_matrices(&model, false);
        for m in solver.skinning_matrices() {
            assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-5), "{:?}", m);
        }
        assert_vec3_near(solver.bone_position(0).unwrap(), Vec3::new(0.0, 3.0, 0.0), 1e-5);
    }

    #[test]
    fn test_animated_parent_keeps_relative_offset() {
        let model = SkeletonModel::new(vec![
            BoneLink::new("root", Vec3::new(0.0, 1.0, 0.0), -1),
            BoneLink::new("child", Vec3::new(0.0, 2.0, 0.0), 0),
        ]);
        let mut solver = RigSolver::new(&model);
        let mut pose = BonePose::new();
        pose.set_rotation("root", Quat::from_rotation_z(FRAC_PI_2));
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, false);
        assert_vec3_near(solver.bone_position(1).unwrap(), Vec3::new(-1.0, 1.0, 0.0), 1e-5);
    }

    #[test]
    fn test_grant_rotation_fractional_and_negative() {
        let model = SkeletonModel::new(vec![
            BoneLink::new("arm", Vec3::ZERO, -1),
            BoneLink::new("half", Vec3::X, -1).with_grant(0, 0.5, GrantKind::Rotation),
            BoneLink::new("mirror", Vec3::Y, -1).with_grant(0, -1.0, GrantKind::Rotation),
        ]);
        let mut solver = RigSolver::new(&model);
        let mut pose = BonePose::new();
        pose.set_rotation("arm", Quat::from_rotation_z(FRAC_PI_2));
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, false);

        let half = Quat::from_mat4(&solver.local_matrix(1).unwrap());
        assert!(half.abs_diff_eq(Quat::from_rotation_z(FRAC_PI_4), 1e-5));
        let mirror = Quat::from_mat4(&solver.local_matrix(2).unwrap());
        assert!(mirror.abs_diff_eq(Quat::from_rotation_z(-FRAC_PI_2), 1e-5));
    }

    #[test]
    fn test_grant_translation() {
        let model = SkeletonModel::new(vec![
            BoneLink::new("src", Vec3::ZERO, -1),
            BoneLink::new("dst", Vec3::X, -1).with_grant(0, 0.5, GrantKind::Translation),
        ]);
        let mut solver = RigSolver::new(&model);
        let mut pose = BonePose::new();
        pose.set_translation("src", Vec3::new(0.0, 2.0, 0.0));
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, false);
        assert_vec3_near(solver.bone_position(1).unwrap(), Vec3::new(1.0, 1.0, 0.0), 1e-5);
    }

    #[test]
    fn test_leg_ik_unreachable_target_straightens_leg() {
        let model = leg_model(20);
        let mut solver = RigSolver::new(&model);
        let goal = Vec3::new(0.0, -2.0, 12.0);
        let mut pose = BonePose::new();
        pose.set_translation("leg_ik", goal);
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, true);

        let knee = Quat::from_mat4(&solver.local_matrix(1).unwrap());
        let angle = twist_angle(knee, Vec3::X);
        assert!(angle >= -1e-4 && angle <= 150f32.to_radians() + 1e-4);

        let hip = Vec3::new(0.0, 10.0, 0.0);
        let expected = hip + (goal - hip).normalize() * 10.0;
        assert_vec3_near(solver.bone_position(2).unwrap(), expected, 1e-2);
    }

    #[test]
    fn test_hinge_rate_cap_between_frames() {
        let model = leg_model(20);
        let mut solver = RigSolver::new(&model);
        let cap = solver.config().hinge_rate_cap_far;
        let mut pose = BonePose::new();
        pose.set_translation("leg_ik", Vec3::new(0.0, 8.0, -2.0));

        let mut previous = 0.0f32;
        for _ in 0..12 {
            solver.apply_pose(&model, &pose);
            solver.update_matrices(&model, true);
            let knee = Quat::from_mat4(&solver.local_matrix(1).unwrap());
            let angle = twist_angle(knee, Vec3::X);
            assert!((angle - previous).abs() <= cap + 1e-4, "{} -> {}", previous, angle);
            assert!(angle >= -1e-4 && angle <= 150f32.to_radians() + 1e-4);
            previous = angle;
        }
        assert!(previous > 1.0);
    }

    #[test]
    fn test_reset_ik_state_restarts_hinge_from_zero() {
        let model = leg_model(20);
        let mut solver = RigSolver::new(&model);
        let cap = solver.config().hinge_rate_cap_far;
        let mut pose = BonePose::new();
        pose.set_translation("leg_ik", Vec3::new(0.0, 8.0, -2.0));
        for _ in 0..12 {
            solver.apply_pose(&model, &pose);
            solver.update_matrices(&model, true);
        }
        let knee = Quat::from_mat4(&solver.local_matrix(1).unwrap());
        assert!(twist_angle(knee, Vec3::X) > 1.0);

        solver.reset_ik_state();
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, true);
        let knee = Quat::from_mat4(&solver.local_matrix(1).unwrap());
        assert!(twist_angle(knee, Vec3::X) <= cap + 1e-4);
    }

    #[test]
    fn test_three_axis_limited_link() {
        let ik = IkConfig {
            target_bone: 2,
            iterations: 20,
            limit_angle: 1.0,
            links: vec![IkLink::limited(
                1,
                Vec3::new(-1.0, -0.3, 0.0),
                Vec3::new(1.0, 0.3, 0.0),
            )],
        };
        let model = SkeletonModel::new(vec![
            BoneLink::new("root", Vec3::ZERO, -1),
            BoneLink::new("mid", Vec3::Y, 0),
            BoneLink::new("tip", Vec3::Y * 2.0, 1),
            BoneLink::new("ik", Vec3::ZERO, -1).with_ik(ik),
        ]);
        assert!(model.bones()[3].ik_config.as_ref().unwrap().links[0].hinge_axis().is_none());
        let mut solver = RigSolver::new(&model);

        // 需要绕 X 转 90°：X 被钳制在上限，锁定的 Z 精确为 0
        let mut pose = BonePose::new();
        pose.set_translation("ik", Vec3::new(0.0, 1.0, 1.0));
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, true);
        let mid = Quat::from_mat4(&solver.local_matrix(1).unwrap());
        let euler = decompose_euler_xyz(mid, Vec3::ZERO);
        assert!((euler.x - 1.0).abs() < 1e-4, "{:?}", euler);
        assert!(euler.y.abs() < 1e-4, "{:?}", euler);
        assert!(euler.z.abs() < 1e-6, "{:?}", euler);

        // 偏向 X 的目标同时需要 Y / Z 分量
        pose.set_translation("ik", Vec3::new(0.8, 1.0, 1.0));
        for _ in 0..3 {
            solver.apply_pose(&model, &pose);
            solver.update_matrices(&model, true);
            let mid = Quat::from_mat4(&solver.local_matrix(1).unwrap());
            let euler = decompose_euler_xyz(mid, Vec3::ZERO);
            assert!(euler.x >= -1.0 - 1e-4 && euler.x <= 1.0 + 1e-4, "{:?}", euler);
            assert!(euler.y.abs() <= 0.3 + 1e-4, "{:?}", euler);
            assert!(euler.z.abs() < 1e-5, "{:?}", euler);
        }
    }

    #[test]
    fn test_parallel_matches_serial() {
        let model = two_leg_model();
        let mut pose = BonePose::new();
        pose.set_translation("ik_L", Vec3::new(0.5, 3.0, -2.0));
        pose.set_translation("ik_R", Vec3::new(-0.3, 2.0, 1.5));
        pose.set_rotation("center", Quat::from_rotation_y(0.3));

        let serial_config = RigConfig {
            parallel_ik: false,
            parallel_skinning: false,
            ..RigConfig::default()
        };
        let mut serial = RigSolver::with_config(&model, serial_config).unwrap();
        let mut parallel = RigSolver::new(&model);
        assert!(parallel.ik_schedule().is_independent(0));
        assert!(parallel.ik_schedule().is_independent(1));

        for solver in [&mut serial, &mut parallel] {
            solver.apply_pose(&model, &pose);
            solver.update_matrices(&model, true);
        }
        for i in 0..model.bone_count() {
            let a = serial.global_matrix(i).unwrap();
            let b = parallel.global_matrix(i).unwrap();
            assert!(a.abs_diff_eq(b, 1e-5), "bone {}", i);
        }
    }

    #[test]
    fn test_ik_idempotent_after_convergence() {
        let ik = IkConfig {
            target_bone: 2,
            iterations: 64,
            limit_angle: 1.0,
            links: vec![IkLink::free(1), IkLink::free(0)],
        };
        let model = SkeletonModel::new(vec![
            BoneLink::new("root", Vec3::ZERO, -1),
            BoneLink::new("mid", Vec3::Y, 0),
            BoneLink::new("tip", Vec3::Y * 2.0, 1),
            BoneLink::new("ik", Vec3::Y * 2.0, -1).with_ik(ik),
        ]);
        let config = RigConfig {
            ik_convergence_epsilon: 1.0e-4,
            ..RigConfig::default()
        };
        let epsilon = config.ik_convergence_epsilon;
        let mut solver = RigSolver::with_config(&model, config).unwrap();
        let mut pose = BonePose::new();
        pose.set_translation("ik", Vec3::new(1.0, -1.0, 0.0));
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, true);
        let first = solver.bone_position(2).unwrap();

        solver.update_matrices(&model, true);
        let second = solver.bone_position(2).unwrap();
        assert!((second - first).length_squared() < epsilon);
    }

    #[test]
    fn test_set_local_pose_updates_subtree() {
        let model = leg_model(20);
        let mut solver = RigSolver::new(&model);
        solver.apply_pose(&model, &BonePose::new());
        solver.update_matrices(&model, false);

        assert!(solver.set_local_pose(&model, 0, Vec3::ZERO, Quat::from_rotation_x(FRAC_PI_2)));
        assert_vec3_near(solver.bone_position(2).unwrap(), Vec3::new(0.0, 10.0, -10.0), 1e-4);
        assert!(!solver.set_local_pose(&model, 99, Vec3::ZERO, Quat::IDENTITY));
        assert!(!solver.set_local_pose(&model, 0, Vec3::NAN, Quat::IDENTITY));
    }

    #[test]
    fn test_disabled_ik_keeps_fk() {
        let model = leg_model(20);
        let mut solver = RigSolver::new(&model);
        assert!(solver.set_ik_enabled(3, false));
        let mut pose = BonePose::new();
        pose.set_translation("leg_ik", Vec3::new(0.0, 8.0, -2.0));
        solver.apply_pose(&model, &pose);
        solver.update_matrices(&model, true);
        assert_vec3_near(solver.bone_position(2).unwrap(), Vec3::ZERO, 1e-5);
    }

    #[test]
    fn test_revision_rebuild() {
        let mut model = leg_model(20);
        let mut solver = RigSolver::new(&model);
        model.bump_revision();
        solver.apply_pose(&model, &BonePose::new());
        solver.update_matrices(&model, true);
        assert_eq!(solver.bone_count(), 4);
        assert_eq!(solver.ik_solvers().len(), 1);
    }
}
