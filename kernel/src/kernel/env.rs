// kernel/src/kernel/env.rs
//
// 環境（= user プロセス）テーブルと、そのライフサイクル。
//
// [設計上の不変条件]
//
// 1. free list
//    - status == Free のスロットは、そしてそれだけが free list から辿れる。
//    - 初期化直後は index 順に並ぶ（最初の確保は必ずスロット 0）。
//
// 2. ハンドル
//    - EnvId の下位 LOG2NENV bit = index、上位 = generation。
//    - スロットを再利用するたびに generation が進むので、古いハンドルは解決できない。
//    - EnvId(0) は「呼び出し元自身」。テーブル参照はしない。
//
// 3. アドレス空間
//    - Free 以外の環境は必ず space を持ち、その root を排他的に所有する。
//
// 4. 破棄
//    - 他 CPU で走行中の環境は Dying にするだけ。実際の解放はその CPU の次の trap 入口。

use crate::error::{Error, KResult};
use crate::logging;
use crate::mem::address_space::AddressSpace;
use crate::mem::layout::USTACKTOP;
use crate::mem::paging::PageFlags;
use crate::types::{EnvId, EnvStatus, TrapFrame, ENVGENSHIFT, NENV};

use super::hal::{CpuId, Hal};
use super::{Kernel, LogEvent};

#[derive(Clone, Copy, Debug)]
pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    /// dispatch された回数
    pub runs: u64,
    /// 最後に dispatch した CPU（診断用）
    pub cpunum: usize,
    pub space: Option<AddressSpace>,
    pub tf: TrapFrame,

    /// None なら page fault で破棄
    pub pgfault_upcall: Option<u64>,

    pub ipc_recving: bool,
    /// 受信側が要求したマップ先（UTOP 以上なら None）
    pub ipc_dstva: Option<u64>,
    pub ipc_from: EnvId,
    pub ipc_value: u32,
    pub ipc_perm: PageFlags,

    next_free: Option<usize>,
}

impl Env {
    pub const EMPTY: Env = Env {
        id: EnvId(0),
        parent_id: EnvId(0),
        status: EnvStatus::Free,
        runs: 0,
        cpunum: 0,
        space: None,
        tf: TrapFrame::zeroed(),
        pgfault_upcall: None,
        ipc_recving: false,
        ipc_dstva: None,
        ipc_from: EnvId(0),
        ipc_value: 0,
        ipc_perm: PageFlags::empty(),
        next_free: None,
    };
}

/// スロット再利用時の新しい EnvId
pub fn next_env_id(old: EnvId, index: usize) -> EnvId {
    let mut generation = old.0.wrapping_add(1 << ENVGENSHIFT) & !((NENV as i32) - 1);
    if generation <= 0 {
        generation = 1 << ENVGENSHIFT;
    }
    EnvId(generation | index as i32)
}

pub struct EnvTable {
    envs: &'static mut [Env],
    free_head: Option<usize>,
}

impl EnvTable {
    /// 全スロットを Free にし、index 順に free list へ繋ぐ。
    pub fn new(storage: &'static mut [Env]) -> Self {
        assert!(
            !storage.is_empty() && storage.len() <= NENV,
            "env table size must be in 1..=NENV"
        );

        let len = storage.len();
        for (i, e) in storage.iter_mut().enumerate() {
            *e = Env::EMPTY;
            e.next_free = if i + 1 < len { Some(i + 1) } else { None };
        }

        EnvTable {
            envs: storage,
            free_head: Some(0),
        }
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn get(&self, idx: usize) -> &Env {
        &self.envs[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Env {
        &mut self.envs[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter()
    }

    pub fn free_head(&self) -> Option<usize> {
        self.free_head
    }

    pub fn free_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while let Some(i) = cur {
            n += 1;
            cur = self.envs[i].next_free;
        }
        n
    }

    fn pop_free(&mut self) -> Option<usize> {
        let idx = self.free_head?;
        self.free_head = self.envs[idx].next_free.take();
        Some(idx)
    }

    fn push_free(&mut self, idx: usize) {
        self.envs[idx].next_free = self.free_head;
        self.free_head = Some(idx);
    }

    /// ハンドル → スロット index。
    ///
    /// - id == 0 は caller 自身。
    /// - Free スロットや generation 不一致は BadEnv。
    /// - checkperm なら caller 自身か caller の直接の子だけ許す。
    pub fn resolve(&self, id: EnvId, caller: Option<usize>, checkperm: bool) -> KResult<usize> {
        if id.is_current() {
            return caller.ok_or(Error::BadEnv);
        }

        let idx = id.index();
        let e = self.envs.get(idx).ok_or(Error::BadEnv)?;
        if e.status == EnvStatus::Free || e.id != id {
            return Err(Error::BadEnv);
        }

        if checkperm {
            let Some(c) = caller else {
                return Err(Error::BadEnv);
            };
            if idx != c && e.parent_id != self.envs[c].id {
                return Err(Error::BadEnv);
            }
        }
        Ok(idx)
    }
}

// ──────────────────────────────────────────────
// ライフサイクル（Kernel 側の操作）
// ──────────────────────────────────────────────

impl<H: Hal> Kernel<H> {
    /// 新しい環境を確保する。
    /// - 空きが無ければ NoFreeEnv、アドレス空間が作れなければ NoMem（どちらも状態は変えない）
    pub fn env_alloc(&mut self, parent_id: EnvId) -> KResult<usize> {
        let idx = self.envs.free_head().ok_or(Error::NoFreeEnv)?;
        self.env_setup_vm(idx)?;

        let popped = self.envs.pop_free();
        debug_assert_eq!(popped, Some(idx));

        let e = self.envs.get_mut(idx);
        let id = next_env_id(e.id, idx);
        let space = e.space;
        *e = Env {
            id,
            parent_id,
            status: EnvStatus::Runnable,
            space,
            tf: TrapFrame::new_user(USTACKTOP),
            ..Env::EMPTY
        };

        logging::info_fmt(format_args!("[{}] new env {}", parent_id, id));
        self.push_event(LogEvent::EnvCreated(id));
        Ok(idx)
    }

    /// 環境を解放して free list に戻す。
    /// - この CPU で走っていた環境なら、先に kernel root へ CR3 を戻す。
    pub fn env_free(&mut self, cpu: CpuId, idx: usize) {
        let id = self.envs.get(idx).id;
        let actor = self.current_id(cpu).unwrap_or(EnvId(0));

        if self.cpus[cpu.index()].cur == Some(idx) {
            self.hal.load_root(cpu, self.kern_root);
        }

        logging::info_fmt(format_args!("[{}] free env {}", actor, id));

        if let Some(space) = self.envs.get_mut(idx).space.take() {
            space.release(&mut self.hal);
        }

        let e = self.envs.get_mut(idx);
        *e = Env { id, ..Env::EMPTY };
        self.envs.push_free(idx);

        self.push_event(LogEvent::EnvFreed(id));
    }

    /// 環境を破棄する。
    /// - 他 CPU の current なら（status に関わらず）Dying にして戻る。その CPU の次の trap で回収。
    /// - 自分自身なら current を外す。呼び出し側は scheduler へ進む。
    pub fn env_destroy(&mut self, cpu: CpuId, idx: usize) {
        let here = self.cpus[cpu.index()].cur == Some(idx);

        if self.running_elsewhere(cpu, idx) {
            let e = self.envs.get_mut(idx);
            e.status = EnvStatus::Dying;
            let id = e.id;
            self.push_event(LogEvent::EnvMarkedDying(id));
            return;
        }

        let id = self.envs.get(idx).id;
        self.env_free(cpu, idx);
        self.push_event(LogEvent::EnvDestroyed(id));

        if here {
            self.cpus[cpu.index()].cur = None;
        }
    }

    /// 起動時専用: 親なしの環境を作り、イメージをロードする。
    pub fn env_create(&mut self, image: &[u8]) -> KResult<EnvId> {
        let idx = self.env_alloc(EnvId(0))?;
        if let Err(e) = self.load_image(idx, image) {
            self.env_free(CpuId::BOOT, idx);
            return Err(e);
        }
        Ok(self.envs.get(idx).id)
    }
}
