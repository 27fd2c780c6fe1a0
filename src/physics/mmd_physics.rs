//! MMD 物理世界管理器
//!
//! 每帧流程：同步运动学刚体目标 → 固定步长累加器 →
//! [子步：积分 → 关节迭代 → 碰撞迭代 → 速度更新] → 回写骨骼。
//! 物理在模型局部空间运行，角色整体移动通过惯性速度传入。

use std::collections::HashSet;

use glam::{Mat3, Mat4, Vec3};
use rayon::prelude::*;

use crate::math::{decompose_rigid, rotation_vector};
use crate::skeleton::{RigSolver, SkeletonModel};
use crate::Result;

use super::auto_collider;
use super::collision::{
    collide, groups_collide, infer_group_semantics, solve_contact, solve_ground, BroadPhase,
};
use super::config::{get_config, GroupMaskMode, GroupMaskSemantics, PhysicsConfig};
use super::definition::{BodyMode, JointDef, RigidBodyDef};
use super::joint::{pair_mut, JointConstraint, JointStep};
use super::rigid_body::{clamp_length, split, Body};
use super::write_back;

/// 判定运动学刚体"移动过"的阈值
const MOVE_EPSILON: f32 = 1.0e-6;

/// MMD 物理世界
///
/// 流程：build → 每帧 step（可选 apply_model_motion 传入惯性）。
/// 配置在创建时从全局模板复制，之后只读取本实例的副本。
pub struct MMDPhysics {
    config: PhysicsConfig,
    bodies: Vec<Body>,
    joints: Vec<JointConstraint>,
    /// 有关节相连的刚体（排序去重）
    adjacency: Vec<Vec<usize>>,
    group_semantics: GroupMaskSemantics,
    broad_phase: BroadPhase,
    /// 回写顺序（刚体索引）
    write_back_order: Vec<usize>,
    /// 动态刚体关联的骨骼索引集合（构建时计算一次）
    dynamic_bone_indices: HashSet<usize>,

    // --- 用于重建 ---
    body_defs: Vec<RigidBodyDef>,
    joint_defs: Vec<JointDef>,
    revision: u64,

    accumulator: f32,
    quiet_steps: u32,
    sleeping: bool,

    // --- 惯性 ---
    /// 上一帧模型世界位置（用于计算移动速度）
    prev_model_position: Option<Vec3>,
    prev_model_velocity: Vec3,
    /// 下一个固定步施加给动态刚体的速度
    pending_velocity: Vec3,
}

impl Default for MMDPhysics {
    fn default() -> Self {
        Self::new()
    }
}

impl MMDPhysics {
    /// 用全局默认模板创建物理世界
    pub fn new() -> Self {
        Self::from_config(get_config())
    }

    /// 用指定配置创建物理世界
    pub fn with_config(config: PhysicsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    fn from_config(config: PhysicsConfig) -> Self {
        if config.debug_log {
            log::info!(
                "物理世界创建: FPS={}, 子步={}, 迭代={}, 重力={:?}",
                config.physics_fps,
                config.substeps,
                config.solver_iterations,
                config.gravity
            );
        }
        Self {
            config,
            bodies: Vec::new(),
            joints: Vec::new(),
            adjacency: Vec::new(),
            group_semantics: GroupMaskSemantics::CollideWith,
            broad_phase: BroadPhase::default(),
            write_back_order: Vec::new(),
            dynamic_bone_indices: HashSet::new(),
            body_defs: Vec::new(),
            joint_defs: Vec::new(),
            revision: 0,
            accumulator: 0.0,
            quiet_steps: 0,
            sleeping: false,
            prev_model_position: None,
            prev_model_velocity: Vec3::ZERO,
            pending_velocity: Vec3::ZERO,
        }
    }

    // ========================================================================
    // 构建
    // ========================================================================

    /// 构建物理系统
    ///
    /// 刚体按骨骼当前全局矩阵放置；关节锚点按绑定姿态计算。
    pub fn build(
        &mut self,
        model: &SkeletonModel,
        solver: &RigSolver,
        bodies: &[RigidBodyDef],
        joints: &[JointDef],
    ) {
        self.body_defs = bodies.to_vec();
        self.joint_defs = joints.to_vec();
        self.rebuild(model, solver);
    }

    fn rebuild(&mut self, model: &SkeletonModel, solver: &RigSolver) {
        self.build_bodies(model, solver);
        self.build_constraints(model);
        self.revision = model.revision();
        self.accumulator = 0.0;
        self.quiet_steps = 0;
        self.sleeping = false;
        self.pending_velocity = Vec3::ZERO;

        let count = |mode: BodyMode| {
            self.bodies
                .iter()
                .filter(|b| b.mode == mode && !b.auto_generated)
                .count()
        };
        log::info!(
            "物理构建完成: {} 刚体 ({}跟骨 + {}物理 + {}物理跟骨 + {}自动), {} 关节, 回写 {} 骨骼, 碰撞组语义 {:?}",
            self.bodies.len(),
            count(BodyMode::FollowBone),
            count(BodyMode::Physics),
            count(BodyMode::PhysicsWithBone),
            self.bodies.iter().filter(|b| b.auto_generated).count(),
            self.joints.len(),
            self.write_back_order.len(),
            self.group_semantics
        );
    }

    fn build_bodies(&mut self, model: &SkeletonModel, solver: &RigSolver) {
        self.group_semantics = match self.config.group_mask_mode {
            GroupMaskMode::Explicit(semantics) => semantics,
            GroupMaskMode::Infer => {
                infer_group_semantics(self.body_defs.iter().map(|d| d.group_mask))
            }
        };

        let config = &self.config;
        let make = |def: &RigidBodyDef| {
            let bone = model.resolve(def.bone_index);
            if def.bone_index >= 0 && bone.is_none() {
                log::warn!("刚体 '{}' 的骨骼索引 {} 越界，视为无骨骼", def.name, def.bone_index);
            }
            let bone_bind = bone.map(|b| Mat4::from_translation(model.bones()[b].initial_position));
            let mut body = Body::from_def(def, bone, bone_bind, config);
            // 放到当前姿态
            if let Some(global) = bone.and_then(|b| solver.global_matrix(b)) {
                body.teleport(global * body.bone_offset);
            }
            body
        };
        let mut bodies: Vec<Body> = self.body_defs.iter().map(make).collect();

        let mut owned = vec![false; model.bone_count()];
        for bone in bodies.iter().filter_map(|b| b.bone_index) {
            owned[bone] = true;
        }
        let autos =
            auto_collider::generate(model, &owned, &config.auto_colliders, self.group_semantics);
        bodies.extend(autos.iter().map(|def| {
            let mut body = make(def);
            body.auto_generated = true;
            body
        }));

        self.dynamic_bone_indices = bodies
            .iter()
            .filter(|b| b.is_dynamic())
            .filter_map(|b| b.bone_index)
            .collect();
        self.bodies = bodies;
    }

    fn build_constraints(&mut self, model: &SkeletonModel) {
        self.joints.clear();
        self.adjacency = vec![Vec::new(); self.bodies.len()];

        if self.config.joints_enabled {
            let authored = self.body_defs.len();
            for def in &self.joint_defs {
                let resolve = |i: i32| usize::try_from(i).ok().filter(|&i| i < authored);
                let (Some(a), Some(b)) = (resolve(def.body_a), resolve(def.body_b)) else {
                    log::warn!("关节 '{}' 的刚体索引无效 ({}, {})，跳过", def.name, def.body_a, def.body_b);
                    continue;
                };
                if a == b {
                    log::warn!("关节 '{}' 连接同一个刚体，跳过", def.name);
                    continue;
                }
                let joint = JointConstraint::from_def(
                    def,
                    a,
                    b,
                    self.bodies[a].bind_transform,
                    self.bodies[b].bind_transform,
                );
                self.adjacency[a].push(b);
                self.adjacency[b].push(a);
                self.joints.push(joint);
            }
        }
        for list in &mut self.adjacency {
            list.sort_unstable();
            list.dedup();
        }

        let eligible = write_back::eligible_bodies(&self.bodies, self.config.write_back_policy);
        self.write_back_order =
            write_back::build_order(model, &self.bodies, &eligible, &self.joints);
    }

    // ========================================================================
    // 步进
    // ========================================================================

    /// 推进物理并把结果写回骨骼
    ///
    /// 调用前骨骼应已完成本帧的 FK / IK。累积时间超出
    /// `max_catch_up_steps` 个固定步的部分直接丢弃。
    pub fn step(&mut self, dt: f32, model: &SkeletonModel, solver: &mut RigSolver) {
        solver.ensure_revision(model);
        if self.revision != model.revision() {
            log::debug!("骨骼模型版本变化，重建物理世界");
            self.rebuild(model, solver);
        }
        if self.bodies.is_empty() {
            return;
        }

        let fixed = self.config.fixed_timestep();
        if dt.is_finite() && dt > 0.0 {
            self.accumulator += dt;
        }

        let mut steps = 0;
        let mut first = true;
        while self.accumulator >= fixed && steps < self.config.max_catch_up_steps {
            self.accumulator -= fixed;
            steps += 1;
            let moved = if first {
                self.update_kinematic_targets(solver)
            } else {
                self.hold_kinematic_targets()
            };
            first = false;
            self.fixed_step(fixed, moved);
        }
        if self.accumulator >= fixed {
            if self.config.debug_log {
                log::debug!("物理落后 {:.3}s，丢弃", self.accumulator);
            }
            self.accumulator %= fixed;
        }

        self.write_back(model, solver);
        solver.update_matrices(model, false);
    }

    /// 运动学刚体目标 = 骨骼全局 * 偏移；返回是否有刚体移动
    fn update_kinematic_targets(&mut self, solver: &RigSolver) -> bool {
        let mut moved = false;
        for body in self.bodies.iter_mut().filter(|b| !b.is_dynamic()) {
            let target = match body.bone_index.and_then(|b| solver.global_matrix(b)) {
                Some(global) => global * body.bone_offset,
                None => body.bind_transform,
            };
            let (position, rotation) = split(target);
            if !position.is_finite() || !rotation.is_finite() {
                continue;
            }
            if (position - body.position).length_squared() > MOVE_EPSILON * MOVE_EPSILON
                || body.rotation.dot(rotation).abs() < 1.0 - MOVE_EPSILON
            {
                moved = true;
            }
            body.start_position = body.position;
            body.start_rotation = body.rotation;
            body.target_position = position;
            body.target_rotation = rotation;
        }
        moved
    }

    /// 同一帧的后续固定步：运动学刚体停在目标上
    fn hold_kinematic_targets(&mut self) -> bool {
        for body in self.bodies.iter_mut().filter(|b| !b.is_dynamic()) {
            body.start_position = body.target_position;
            body.start_rotation = body.target_rotation;
        }
        false
    }

    fn fixed_step(&mut self, fixed: f32, moved: bool) {
        let impulse = self.pending_velocity != Vec3::ZERO;
        // sleep_steps == 0 表示从不休眠
        let drowsy = self.config.sleep_steps > 0 && self.quiet_steps >= self.config.sleep_steps;
        if !moved && !impulse && drowsy {
            self.sleeping = true;
            return;
        }
        self.sleeping = false;

        let substeps = self.config.substeps.max(1);
        let h = fixed / substeps as f32;

        let pending = std::mem::take(&mut self.pending_velocity);
        if impulse {
            for body in self.bodies.iter_mut().filter(|b| b.is_dynamic()) {
                body.linear_velocity += pending;
            }
        }

        for sub in 0..substeps {
            let t = (sub + 1) as f32 / substeps as f32;
            self.substep(h, t);
        }

        let config = &self.config;
        let quiet = self
            .bodies
            .iter()
            .filter(|b| b.is_dynamic())
            .all(|b| b.is_quiet(config.sleep_linear_threshold, config.sleep_angular_threshold));
        self.quiet_steps = if quiet && !moved { self.quiet_steps.saturating_add(1) } else { 0 };

        if self.config.debug_log {
            let worst = self
                .joints
                .iter()
                .map(|j| j.anchor_error(&self.bodies[j.body_a], &self.bodies[j.body_b]))
                .fold(0.0f32, f32::max);
            log::debug!("固定步结束: 关节最大锚点误差 {:.5}, 静止步数 {}", worst, self.quiet_steps);
        }
    }

    fn substep(&mut self, h: f32, t: f32) {
        let decay = self.config.warm_start_decay;
        for joint in &mut self.joints {
            joint.decay(decay);
        }

        // 运动学刚体插值到目标
        for body in &mut self.bodies {
            body.prev_position = body.position;
            body.prev_rotation = body.rotation;
            if !body.is_dynamic() {
                body.position = body.start_position.lerp(body.target_position, t);
                body.rotation = body.start_rotation.slerp(body.target_rotation, t).normalize();
            }
        }

        let gravity = self.config.gravity;
        self.bodies.par_iter_mut().for_each(|body| body.integrate(gravity, h));

        self.solve_joints(h);
        self.solve_collisions(h);
        self.project_joint_limits();

        let config = &self.config;
        self.bodies
            .par_iter_mut()
            .for_each(|body| finalize_velocity(body, h, config));
    }

    fn solve_joints(&mut self, h: f32) {
        let iterations = self.config.solver_iterations;
        for iteration in 0..iterations {
            let step = JointStep { h, last_iteration: iteration + 1 == iterations };
            for joint in &mut self.joints {
                let Some((a, b)) = pair_mut(&mut self.bodies, joint.body_a, joint.body_b) else {
                    continue;
                };
                if !a.is_dynamic() && !b.is_dynamic() {
                    continue;
                }
                joint.solve_angular(a, b, step, &self.config);
                joint.solve_position(a, b, step, &self.config);
            }
        }
    }

    /// 关节和碰撞迭代之后，把所有关节的相对旋转投影回限制内
    fn project_joint_limits(&mut self) {
        for joint in &mut self.joints {
            let Some((a, b)) = pair_mut(&mut self.bodies, joint.body_a, joint.body_b) else {
                continue;
            };
            joint.project_limits(a, b);
        }
    }

    fn solve_collisions(&mut self, h: f32) {
        let margin = self.config.collision_margin;
        let pairs: Vec<(usize, usize)> = self
            .broad_phase
            .update(&self.bodies, margin)
            .into_iter()
            .filter(|&(a, b)| self.pair_allowed(a, b))
            .collect();

        for _ in 0..self.config.collision_iterations {
            for &(a, b) in &pairs {
                let Some((body_a, body_b)) = pair_mut(&mut self.bodies, a, b) else {
                    continue;
                };
                if let Some(contact) = collide(body_a, body_b) {
                    solve_contact(body_a, body_b, &contact, h, &self.config);
                }
            }
            if self.config.ground_enabled {
                let height = self.config.ground_height;
                for body in self.bodies.iter_mut().filter(|b| b.is_dynamic()) {
                    solve_ground(body, height, h, &self.config);
                }
            }
        }
    }

    fn pair_allowed(&self, a: usize, b: usize) -> bool {
        let (ba, bb) = (&self.bodies[a], &self.bodies[b]);
        if !ba.is_dynamic() && !bb.is_dynamic() {
            return false;
        }
        if self.config.exclude_jointed_pairs && self.adjacency[a].binary_search(&b).is_ok() {
            return false;
        }
        if !groups_collide(self.group_semantics, ba.group, ba.group_mask, bb.group, bb.group_mask) {
            return false;
        }
        let reach = ba.bounding_radius() + bb.bounding_radius() + self.config.collision_margin;
        (ba.position - bb.position).length_squared() <= reach * reach
    }

    // ========================================================================
    // 回写
    // ========================================================================

    /// 按依赖顺序把动态刚体写回骨骼本地姿态
    fn write_back(&self, model: &SkeletonModel, solver: &mut RigSolver) {
        for &index in &self.write_back_order {
            let body = &self.bodies[index];
            let Some(bone) = body.bone_index.filter(|&b| b < model.bone_count()) else {
                continue;
            };
            let global = body.transform() * body.inv_bone_offset;
            if !global.is_finite() {
                continue;
            }
            let link = &model.bones()[bone];
            let parent = link
                .parent_id()
                .and_then(|p| solver.global_matrix(p))
                .unwrap_or(Mat4::IDENTITY);
            let Some((translation, rotation)) = decompose_rigid(&(parent.inverse() * global)) else {
                continue;
            };
            let translation = if body.keep_translation {
                solver.local_pose(bone).map_or(Vec3::ZERO, |p| p.translation)
            } else {
                translation - link.bone_offset()
            };
            if !solver.set_local_pose(model, bone, translation, rotation) && self.config.debug_log {
                log::debug!("刚体 '{}' 回写骨骼 {} 失败", body.name, bone);
            }
        }
    }

    // ========================================================================
    // 控制
    // ========================================================================

    /// 刚体回到骨骼当前姿态，清空速度、累计乘子和时间累加器
    pub fn reset(&mut self, model: &SkeletonModel, solver: &RigSolver) {
        if self.revision != model.revision() {
            self.rebuild(model, solver);
        }
        for body in &mut self.bodies {
            let transform = match body.bone_index.and_then(|b| solver.global_matrix(b)) {
                Some(global) => global * body.bone_offset,
                None => body.bind_transform,
            };
            body.teleport(transform);
        }
        for joint in &mut self.joints {
            joint.reset();
        }
        self.accumulator = 0.0;
        self.quiet_steps = 0;
        self.sleeping = false;
        self.prev_model_position = None;
        self.prev_model_velocity = Vec3::ZERO;
        self.pending_velocity = Vec3::ZERO;
    }

    /// 设置重力并唤醒世界
    pub fn set_gravity(&mut self, gravity: Vec3) {
        if !gravity.is_finite() {
            log::warn!("忽略非有限重力 {:?}", gravity);
            return;
        }
        self.config.gravity = gravity;
        self.wake();
    }

    #[inline]
    pub fn gravity(&self) -> Vec3 {
        self.config.gravity
    }

    /// 传入模型世界变换，由速度变化产生惯性
    ///
    /// 模型加速时动态刚体获得相反方向的速度（头发 / 裙子自然后拽）。
    /// 速度超过 `max_model_speed` 视为传送，不产生惯性。
    pub fn apply_model_motion(&mut self, model_transform: Mat4, dt: f32) {
        let position = model_transform.w_axis.truncate();
        if !position.is_finite() {
            return;
        }
        let velocity = match self.prev_model_position {
            Some(prev) if dt > 0.0 && dt.is_finite() => (position - prev) / dt,
            _ => Vec3::ZERO,
        };
        self.prev_model_position = Some(position);

        if velocity.length() > self.config.max_model_speed {
            if self.config.debug_log {
                log::debug!("模型速度 {:.2} 超过上限，视为传送", velocity.length());
            }
            self.prev_model_velocity = Vec3::ZERO;
            return;
        }

        let delta = velocity - self.prev_model_velocity;
        self.prev_model_velocity = velocity;
        let strength = self.config.inertia_strength;
        if strength <= 0.0 || delta.length_squared() < 1.0e-8 {
            return;
        }

        // 世界速度变化 → 模型局部空间（R^T * v_world）
        let rot_inv = Mat3::from_mat4(model_transform).transpose();
        let local = rot_inv * delta;
        if !local.is_finite() {
            return;
        }
        self.pending_velocity = clamp_length(
            self.pending_velocity - local * strength,
            self.config.max_linear_velocity,
        );
        self.wake();
    }

    /// 唤醒世界
    pub fn wake(&mut self) {
        self.quiet_steps = 0;
        self.sleeping = false;
    }

    /// 替换配置（只影响本世界）并重建
    pub fn set_config(
        &mut self,
        config: PhysicsConfig,
        model: &SkeletonModel,
        solver: &RigSolver,
    ) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.rebuild(model, solver);
        Ok(())
    }

    // ========================================================================
    // 查询
    // ========================================================================

    #[inline]
    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    #[inline]
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    #[inline]
    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    #[inline]
    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    #[inline]
    pub fn joints(&self) -> &[JointConstraint] {
        &self.joints
    }

    pub fn body_transform(&self, index: usize) -> Option<Mat4> {
        self.bodies.get(index).map(Body::transform)
    }

    /// 关节两侧坐标系的相对欧拉角
    pub fn joint_relative_euler(&self, index: usize) -> Option<Vec3> {
        let joint = self.joints.get(index)?;
        let a = self.bodies.get(joint.body_a)?;
        let b = self.bodies.get(joint.body_b)?;
        Some(joint.relative_euler(a, b))
    }

    /// 动态刚体关联的骨骼索引集合（构建时已预计算）
    #[inline]
    pub fn dynamic_bone_indices(&self) -> &HashSet<usize> {
        &self.dynamic_bone_indices
    }

    /// 回写顺序（刚体索引）
    #[inline]
    pub fn write_back_order(&self) -> &[usize] {
        &self.write_back_order
    }

    #[inline]
    pub fn group_semantics(&self) -> GroupMaskSemantics {
        self.group_semantics
    }
}

/// 子步内的旋转变化（旋转向量）
#[inline]
fn angular_displacement(body: &Body) -> Vec3 {
    rotation_vector((body.rotation * body.prev_rotation.inverse()).normalize())
}

/// 由位移推导速度，混合积分速度后阻尼并钳制；非有限时回退到子步开始
fn finalize_velocity(body: &mut Body, h: f32, config: &PhysicsConfig) {
    if !body.is_dynamic() {
        body.linear_velocity = (body.position - body.prev_position) / h;
        body.angular_velocity = angular_displacement(body) / h;
        return;
    }
    if !body.position.is_finite() || !body.rotation.is_finite() {
        log::warn!("刚体 '{}' 出现非有限值，回退到子步开始", body.name);
        body.position = body.prev_position;
        body.rotation = body.prev_rotation;
        body.linear_velocity = Vec3::ZERO;
        body.angular_velocity = Vec3::ZERO;
        return;
    }

    let blend = config.velocity_blend;
    let derived_linear = (body.position - body.prev_position) / h;
    let derived_angular = angular_displacement(body) / h;
    let mut linear = derived_linear * blend + body.integrated_linear * (1.0 - blend);
    let mut angular = derived_angular * blend + body.integrated_angular * (1.0 - blend);

    linear *= (1.0 - body.linear_damping).powf(h);
    angular *= (1.0 - body.angular_damping).powf(h);
    linear = clamp_length(linear, config.max_linear_velocity);
    angular = clamp_length(angular, config.max_angular_velocity);

    if linear.length() < config.sleep_linear_threshold {
        linear = Vec3::ZERO;
    }
    if angular.length() < config.sleep_angular_threshold {
        angular = Vec3::ZERO;
    }
    if !linear.is_finite() || !angular.is_finite() {
        linear = Vec3::ZERO;
        angular = Vec3::ZERO;
    }
    body.linear_velocity = linear;
    body.angular_velocity = angular;
}
