// kernel/src/kernel/sched.rs
//
// ラウンドロビン scheduler
// - current の次のスロットから一周して最初の Runnable を選ぶ（他 CPU の current は飛ばす）
// - 無ければ、current がこの CPU で Running のままならそれを続ける
// - それも無ければ CPU を halt（Dispatch::Idle）

use crate::logging;
use crate::types::EnvStatus;

use super::hal::{CpuId, Hal};
use super::{CpuStatus, Dispatch, Kernel, LogEvent};

impl<H: Hal> Kernel<H> {
    pub fn sched_yield(&mut self, cpu: CpuId) -> Dispatch {
        let n = self.envs.len();
        let cur = self.cpus[cpu.index()].cur;
        let start = cur.map(|c| c + 1).unwrap_or(0);

        for k in 0..n {
            let idx = (start + k) % n;
            if self.envs.get(idx).status == EnvStatus::Runnable && !self.running_elsewhere(cpu, idx) {
                return self.env_run(cpu, idx);
            }
        }

        if let Some(c) = cur {
            let e = self.envs.get(c);
            if e.status == EnvStatus::Running && e.cpunum == cpu.index() {
                return self.env_run(cpu, c);
            }
        }

        self.sched_halt(cpu)
    }

    /// 走らせるものが無い CPU を止める
    fn sched_halt(&mut self, cpu: CpuId) -> Dispatch {
        let alive = self.envs.iter().any(|e| {
            matches!(
                e.status,
                EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying
            )
        });
        if !alive {
            logging::info("No runnable environments in the system!");
        }

        let c = cpu.index();
        self.cpus[c].cur = None;
        self.hal.load_root(cpu, self.kern_root);
        self.cpus[c].status = CpuStatus::Halted;

        self.push_event(LogEvent::CpuIdle(c));
        Dispatch::Idle
    }
}
