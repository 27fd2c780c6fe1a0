//! IK 链调度
//!
//! 每条链有写集合（链接骨骼及其全部后代、付与依赖）和读集合
//! （求解路径、路径上方祖先、IK 目标骨骼及其祖先）。两条链冲突当且仅当
//! 一方的写集合与另一方的读/写集合相交。
//!
//! 冲突边总是从模型顺序靠前的链指向靠后的链，用 Kahn 算法分层：
//! 同一阶段内的链两两不冲突，可以并行求解；阶段之间严格按顺序执行，
//! 因此结果与按模型顺序串行求解一致。

use super::ik_solver::IkSolver;
use super::model::SkeletonModel;

/// IK 链调度结果
#[derive(Clone, Debug, Default)]
pub struct IkSchedule {
    stages: Vec<Vec<usize>>,
}

struct ChainSets {
    write: Vec<usize>,
    read: Vec<usize>,
}

impl IkSchedule {
    /// 按读写集合构建阶段
    pub fn build(model: &SkeletonModel, solvers: &[IkSolver]) -> Self {
        let sets: Vec<ChainSets> = solvers
            .iter()
            .map(|s| ChainSets {
                write: s.write_set(model),
                read: s.read_set(model),
            })
            .collect();

        let n = sets.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for i in 0..n {
            for j in (i + 1)..n {
                if conflicts(&sets[i], &sets[j]) {
                    successors[i].push(j);
                    in_degree[j] += 1;
                }
            }
        }

        let mut stages = Vec::new();
        let mut frontier: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut placed = 0;
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for &i in &frontier {
                for &j in &successors[i] {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            placed += frontier.len();
            next.sort_unstable();
            stages.push(std::mem::replace(&mut frontier, next));
        }
        debug_assert_eq!(placed, n);

        let parallel = stages.iter().filter(|s| s.len() > 1).count();
        log::debug!("IK 调度: {} 条链, {} 个阶段 ({} 个可并行)", n, stages.len(), parallel);

        Self { stages }
    }

    #[inline]
    pub fn stages(&self) -> &[Vec<usize>] {
        &self.stages
    }

    /// 链是否与同阶段的其他链并行求解
    pub fn is_independent(&self, chain: usize) -> bool {
        self.stages
            .iter()
            .any(|s| s.len() > 1 && s.contains(&chain))
    }
}

fn conflicts(a: &ChainSets, b: &ChainSets) -> bool {
    intersects(&a.write, &b.write) || intersects(&a.write, &b.read) || intersects(&b.write, &a.read)
}

/// 两个已排序去重的索引集合是否相交
fn intersects(a: &[usize], b: &[usize]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => return true,
        }
    }
    false
}
