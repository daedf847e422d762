// src/kernel/mod.rs
//
// exo-kernel: 環境テーブル + ラウンドロビン + user レベル page fault upcall を持つ exokernel コア
//
// - Env: EnvId + EnvStatus + 自前の AddressSpace + 保存 TrapFrame
// - trap(): 全 trap の単一入口。最後に必ず Dispatch（再開する frame か idle）を返す
// - syscall: プリミティブだけを提供し、fork などの方針は user ライブラリに任せる
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. ロック
//    - &mut Kernel を持っていること = big kernel lock を持っていること。
//    - 実機では state_ref の spin::Mutex が唯一の入口。
//
// 2. current
//    - cpus[c].cur == Some(i) なら envs[i].status は Running。
//      例外は他から Dying / NotRunnable を付けられた直後で、その CPU の次の trap で片付く。
//    - 1 つの環境が 2 つの CPU の current になることはない（scheduler は他 CPU の current を選ばない）。
//
// 3. アドレス空間
//    - CPU にロードされる root は kern_root か、その CPU の current 環境の root だけ。
//
// これらは debug_check_invariants() でログ出力ベースに検証される。

pub mod elf;
pub mod env;
pub mod hal;
pub mod ipc;
pub mod loader;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod user_program;
pub mod vm;

#[cfg(target_os = "none")]
pub mod entry;
#[cfg(target_os = "none")]
pub mod state_ref;

use crate::logging;
use crate::mem::addr::{PhysFrame, VirtAddr};
use crate::types::{EnvId, EnvStatus, TrapFrame, NCPU};

pub use env::{Env, EnvTable};
pub use hal::{CpuId, Hal, Platform};

const EVENT_LOG_CAP: usize = 256;

//
// ──────────────────────────────────────────────
// CpuState / Dispatch
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStatus {
    Unused,
    Started,
    /// sched_halt で止まっている。次の trap で Started に戻る
    Halted,
}

#[derive(Clone, Copy, Debug)]
pub struct CpuState {
    pub status: CpuStatus,
    /// 今この CPU で走っている環境（テーブル index）
    pub cur: Option<usize>,
}

impl CpuState {
    const INIT: CpuState = CpuState {
        status: CpuStatus::Unused,
        cur: None,
    };
}

/// trap 処理の結論。呼び出し側（arch / hosted）はロックを離してから従う。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// この frame で user に戻る（ロード済み root は current 環境のもの）
    Resume(TrapFrame),
    /// 走らせるものが無い。割り込み許可で hlt
    Idle,
}

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    EnvCreated(EnvId),
    EnvFreed(EnvId),
    EnvDestroyed(EnvId),
    EnvMarkedDying(EnvId),
    EnvRun { cpu: usize, env: EnvId },
    CpuIdle(usize),
    PageFaultUpcall { env: EnvId, fault_va: u64, utf_va: u64 },
    UserFaultKilled { env: EnvId, fault_va: u64 },
    IpcDelivered { from: EnvId, to: EnvId, value: u32 },
}

//
// ──────────────────────────────────────────────
// Kernel（OS 全体の状態）
// ──────────────────────────────────────────────
//

pub struct Kernel<H: Hal> {
    hal: H,

    envs: EnvTable,
    cpus: [CpuState; NCPU],

    /// 全環境の上半分（kernel 空間）の元になる root
    kern_root: PhysFrame,

    // 抽象イベントログ（リング。古いものから上書き）
    event_log: [Option<LogEvent>; EVENT_LOG_CAP],
    event_log_head: usize,
    event_log_len: usize,
}

impl<H: Hal> Kernel<H> {
    pub fn new(hal: H, kern_root: PhysFrame, env_storage: &'static mut [Env]) -> Self {
        let mut cpus = [CpuState::INIT; NCPU];
        cpus[CpuId::BOOT.index()].status = CpuStatus::Started;

        Kernel {
            hal,
            envs: EnvTable::new(env_storage),
            cpus,
            kern_root,
            event_log: [None; EVENT_LOG_CAP],
            event_log_head: 0,
            event_log_len: 0,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn kern_root(&self) -> PhysFrame {
        self.kern_root
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    /// ハンドルから環境を引く（権限チェックなし。診断とテスト用）
    pub fn env(&self, id: EnvId) -> Option<&Env> {
        let idx = self.envs.resolve(id, None, false).ok()?;
        Some(self.envs.get(idx))
    }

    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let idx = self.envs.resolve(id, None, false).ok()?;
        Some(self.envs.get_mut(idx))
    }

    pub fn cpu(&self, cpu: CpuId) -> &CpuState {
        &self.cpus[cpu.index()]
    }

    /// AP が起動したときに呼ぶ
    pub fn cpu_started(&mut self, cpu: CpuId) {
        self.cpus[cpu.index()].status = CpuStatus::Started;
    }

    pub fn current(&self, cpu: CpuId) -> Option<usize> {
        self.cpus[cpu.index()].cur
    }

    pub fn current_id(&self, cpu: CpuId) -> Option<EnvId> {
        self.current(cpu).map(|i| self.envs.get(i).id)
    }

    /// idx が cpu 以外のどこかの CPU の current か
    pub fn running_elsewhere(&self, cpu: CpuId, idx: usize) -> bool {
        self.cpus
            .iter()
            .enumerate()
            .any(|(c, s)| c != cpu.index() && s.cur == Some(idx))
    }

    fn is_current_anywhere(&self, idx: usize) -> bool {
        self.cpus.iter().any(|s| s.cur == Some(idx))
    }

    /// 環境 id の空間で va を翻訳する（診断用）
    pub fn translate(&self, id: EnvId, va: u64) -> Option<u64> {
        let space = self.env(id)?.space?;
        space.translate(&self.hal, VirtAddr(va)).map(|pa| pa.0)
    }

    fn push_event(&mut self, ev: LogEvent) {
        let slot = (self.event_log_head + self.event_log_len) % EVENT_LOG_CAP;
        self.event_log[slot] = Some(ev);
        if self.event_log_len < EVENT_LOG_CAP {
            self.event_log_len += 1;
        } else {
            self.event_log_head = (self.event_log_head + 1) % EVENT_LOG_CAP;
        }
    }

    /// 古い順のイベント列
    pub fn events(&self) -> impl Iterator<Item = LogEvent> + '_ {
        (0..self.event_log_len)
            .filter_map(move |i| self.event_log[(self.event_log_head + i) % EVENT_LOG_CAP])
    }

    pub fn clear_events(&mut self) {
        self.event_log = [None; EVENT_LOG_CAP];
        self.event_log_head = 0;
        self.event_log_len = 0;
    }

    //
    // context switch: 指定環境をこの CPU の current にし、その frame で戻る
    //
    pub fn env_run(&mut self, cpu: CpuId, idx: usize) -> Dispatch {
        let c = cpu.index();

        if let Some(prev) = self.cpus[c].cur {
            let p = self.envs.get_mut(prev);
            if p.status == EnvStatus::Running {
                p.status = EnvStatus::Runnable;
            }
        }

        let e = self.envs.get_mut(idx);
        e.status = EnvStatus::Running;
        e.runs += 1;
        e.cpunum = c;
        let id = e.id;
        let tf = e.tf;
        let Some(space) = e.space else {
            panic!("env_run: env {} has no address space", id);
        };

        self.cpus[c].cur = Some(idx);
        self.cpus[c].status = CpuStatus::Started;
        self.hal.load_root(cpu, space.root());

        self.push_event(LogEvent::EnvRun { cpu: c, env: id });
        Dispatch::Resume(tf)
    }

    //
    // 簡易的な不変条件チェック（デバッグ用）
    //
    pub fn debug_check_invariants(&self) -> bool {
        let mut ok = true;

        // 1. free list と status の対応
        let free_slots = self.envs.iter().filter(|e| e.status == EnvStatus::Free).count();
        if free_slots != self.envs.free_len() {
            logging::error("INVARIANT VIOLATION: free list length != number of Free envs");
            ok = false;
        }

        // 2. Free 以外は必ず space を持つ
        for (i, e) in self.envs.iter().enumerate() {
            if e.status != EnvStatus::Free && e.space.is_none() {
                logging::error("INVARIANT VIOLATION: live env without address space");
                logging::info_u64(" offending_env_index", i as u64);
                ok = false;
            }
        }

        // 3. current の一意性
        for (c, st) in self.cpus.iter().enumerate() {
            let Some(cur) = st.cur else { continue };
            if self.cpus[c + 1..].iter().any(|o| o.cur == Some(cur)) {
                logging::error("INVARIANT VIOLATION: env is current on two cpus");
                logging::info_u64(" env_index", cur as u64);
                ok = false;
            }
            let status = self.envs.get(cur).status;
            if !matches!(status, EnvStatus::Running | EnvStatus::Dying | EnvStatus::NotRunnable) {
                logging::error("INVARIANT VIOLATION: current env is not running");
                logging::info_u64(" cpu", c as u64);
                ok = false;
            }
        }

        ok
    }
}

#[cfg(test)]
mod tests;
