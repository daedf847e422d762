// kernel/src/hosted/machine.rs
//
// 役割:
// - SimHal 上の Kernel を「CPU から見たように」駆動する。
//
// やること:
// - CPU ごとの実行中 frame（iretq 後のレジスタ）を保持し、trap を起こして Kernel::trap に渡す
// - user の load/store を 4-level walk（P/U/W 検査込み）で行い、違反は #PF として上げる
// - upcall から trap 時点の状態へ戻る trampoline の動作を模す
//
// やらないこと:
// - 命令の解釈。user コードの役はテスト（や ulib の hosted Context）が演じる

use crate::error::{Error, KResult};
use crate::kernel::{CpuId, Dispatch, Env, Kernel};
use crate::mem::addr::{PhysFrame, VirtAddr, PAGE_SIZE};
use crate::mem::paging::{PageFlags, Pte};
use crate::mm::PhysMemory;
use crate::types::{
    EnvId, EnvStatus, FaultCode, SyscallRegs, TrapFrame, UTrapframe, GD_KD, GD_KT, IRQ_OFFSET,
    NCPU, T_PGFLT, T_SYSCALL, UTRAPFRAME_SIZE,
};

use super::SimHal;

/// user アクセスが #PF になった結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// upcall が設定されていた。rsp は例外スタック上の UTrapframe を指す
    Upcall { utf_va: u64 },
    /// 環境が破棄された
    Killed,
}

pub struct Machine {
    pub kernel: Kernel<SimHal>,
    cpu: CpuId,
    running: [Option<TrapFrame>; NCPU],
}

impl Machine {
    pub fn new(npages: usize, nenv: usize) -> Machine {
        let mut hal = SimHal::new(npages);
        let Some(root) = hal.make_kernel_root() else {
            panic!("Machine::new: pool too small for the kernel root");
        };
        let envs: &'static mut [Env] = Box::leak(vec![Env::EMPTY; nenv].into_boxed_slice());

        Machine {
            kernel: Kernel::new(hal, root, envs),
            cpu: CpuId::BOOT,
            running: [None; NCPU],
        }
    }

    pub fn hal(&self) -> &SimHal {
        self.kernel.hal()
    }

    pub fn hal_mut(&mut self) -> &mut SimHal {
        self.kernel.hal_mut()
    }

    /// 以後の操作を行う CPU を切り替える（AP なら起動済みにする）
    pub fn select_cpu(&mut self, cpu: CpuId) {
        self.cpu = cpu;
        if cpu != CpuId::BOOT {
            self.kernel.cpu_started(cpu);
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn current(&self) -> Option<EnvId> {
        self.running[self.cpu.index()]?;
        self.kernel.current_id(self.cpu)
    }

    pub fn is_alive(&self, id: EnvId) -> bool {
        self.kernel.env(id).is_some()
    }

    pub fn status(&self, id: EnvId) -> Option<EnvStatus> {
        self.kernel.env(id).map(|e| e.status)
    }

    pub fn console_text(&self) -> String {
        self.hal().console_text()
    }

    /// 実行中のレジスタ
    pub fn regs(&self) -> &TrapFrame {
        match &self.running[self.cpu.index()] {
            Some(tf) => tf,
            None => panic!("cpu {} is idle", self.cpu.0),
        }
    }

    pub fn regs_mut(&mut self) -> &mut TrapFrame {
        match &mut self.running[self.cpu.index()] {
            Some(tf) => tf,
            None => panic!("cpu {} is idle", self.cpu.0),
        }
    }

    // ─────────────────────────────────────────
    // 実行の切り替え
    // ─────────────────────────────────────────

    pub fn create(&mut self, image: &[u8]) -> KResult<EnvId> {
        self.kernel.env_create(image)
    }

    fn follow(&mut self, d: Dispatch) {
        self.running[self.cpu.index()] = match d {
            Dispatch::Resume(tf) => Some(tf),
            Dispatch::Idle => None,
        };
    }

    /// scheduler に次を選ばせる
    pub fn schedule(&mut self) -> Option<EnvId> {
        let d = self.kernel.sched_yield(self.cpu);
        self.follow(d);
        self.current()
    }

    /// 指定環境をこの CPU で走らせる（scheduler がそれを選んだのと同じ）。
    /// 実行中の環境がいれば、タイマで横取りされたときと同じくレジスタを保存してから切り替える。
    pub fn run(&mut self, id: EnvId) -> KResult<()> {
        let idx = self.kernel.envs().resolve(id, None, false)?;
        if self.kernel.envs().get(idx).status != EnvStatus::Runnable {
            return Err(Error::Inval);
        }
        if let (Some(prev), Some(tf)) = (self.current(), self.running[self.cpu.index()]) {
            if let Some(e) = self.kernel.env_mut(prev) {
                e.tf = tf;
            }
        }
        let d = self.kernel.env_run(self.cpu, idx);
        self.follow(d);
        Ok(())
    }

    /// 現在の状態から trap を起こす。idle 中なら kernel モードの frame で入る。
    pub fn trap(&mut self, trapno: u64, err: u64) {
        let mut tf = match self.running[self.cpu.index()] {
            Some(tf) => tf,
            None => TrapFrame {
                cs: GD_KT as u64,
                ss: GD_KD as u64,
                ..TrapFrame::zeroed()
            },
        };
        tf.trapno = trapno;
        tf.err = err;

        let d = self.kernel.trap(self.cpu, &tf);
        self.follow(d);
    }

    pub fn interrupt(&mut self, irq: u64) {
        self.trap(IRQ_OFFSET + irq, 0);
    }

    /// int 0x30。呼び出し元が戻ったときに見るレジスタを返す
    /// （呼び出し元がまだ走っていなければ保存 frame の値、破棄されていれば 0）。
    pub fn syscall(&mut self, no: u64, args: [u64; 5]) -> SyscallRegs {
        let Some(caller) = self.current() else {
            panic!("syscall on idle cpu {}", self.cpu.0);
        };

        let r = &mut self.regs_mut().regs;
        r.rax = no;
        r.rdx = args[0];
        r.rcx = args[1];
        r.rbx = args[2];
        r.rdi = args[3];
        r.rsi = args[4];
        self.trap(T_SYSCALL, 0);

        if self.current() == Some(caller) {
            return SyscallRegs::from_frame(self.regs());
        }
        self.kernel
            .env(caller)
            .map(|e| SyscallRegs::from_frame(&e.tf))
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────
    // user メモリアクセス
    // ─────────────────────────────────────────

    /// 現在ロード中の root から 4-level walk する。再帰スロットもハードと同じく辿れる。
    fn walk(&self, va: u64, write: bool) -> Result<(PhysFrame, usize), FaultCode> {
        let Some(mut table) = self.hal().loaded_root(self.cpu) else {
            panic!("cpu {} has no root loaded", self.cpu.0);
        };
        let mut code = FaultCode::USER;
        if write {
            code |= FaultCode::WRITE;
        }

        let v = VirtAddr(va);
        for level in (1..=4u8).rev() {
            let pte = Pte(self.hal().page(table).entries()[v.table_index(level)]);
            let flags = pte.flags();
            if !flags.contains(PageFlags::PRESENT) {
                return Err(code);
            }
            if !flags.contains(PageFlags::USER) || (write && !flags.contains(PageFlags::WRITABLE)) {
                return Err(code | FaultCode::PROTECTION);
            }
            table = pte.frame();
        }
        Ok((table, v.page_offset()))
    }

    /// #PF を上げ、同じ環境が upcall で戻ってきたかを返す
    fn raise_page_fault(&mut self, va: u64, code: FaultCode) -> Fault {
        let me = self.current();
        self.hal_mut().fault_va = va;
        self.trap(T_PGFLT, code.bits());

        match self.current() {
            Some(id) if Some(id) == me => Fault::Upcall {
                utf_va: self.regs().rsp,
            },
            _ => Fault::Killed,
        }
    }

    fn access(&mut self, va: u64, len: usize, write: bool, mut f: impl FnMut(&mut [u8], usize)) -> Result<(), Fault> {
        // 先に全ページを検査する（途中まで書いて fault しない）
        let mut frames = Vec::new();
        let mut done = 0usize;
        while done < len {
            let addr = va.wrapping_add(done as u64);
            match self.walk(addr, write) {
                Ok((frame, off)) => {
                    let n = core::cmp::min(len - done, PAGE_SIZE as usize - off);
                    frames.push((frame, off, n, done));
                    done += n;
                }
                Err(code) => return Err(self.raise_page_fault(addr, code)),
            }
        }

        for (frame, off, n, at) in frames {
            let page = self.hal_mut().page_mut(frame);
            f(&mut page.bytes[off..off + n], at);
        }
        Ok(())
    }

    pub fn load(&mut self, va: u64, buf: &mut [u8]) -> Result<(), Fault> {
        let len = buf.len();
        self.access(va, len, false, |src, at| {
            buf[at..at + src.len()].copy_from_slice(src);
        })
    }

    pub fn store(&mut self, va: u64, data: &[u8]) -> Result<(), Fault> {
        self.access(va, data.len(), true, |dst, at| {
            dst.copy_from_slice(&data[at..at + dst.len()]);
        })
    }

    pub fn read_u64(&mut self, va: u64) -> Result<u64, Fault> {
        let mut b = [0u8; 8];
        self.load(va, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u64(&mut self, va: u64, value: u64) -> Result<(), Fault> {
        self.store(va, &value.to_le_bytes())
    }

    // ─────────────────────────────────────────
    // upcall
    // ─────────────────────────────────────────

    /// upcall に入った直後の rsp にある UTrapframe を読む
    pub fn read_utrapframe(&mut self) -> Result<UTrapframe, Fault> {
        let mut b = [0u8; UTRAPFRAME_SIZE as usize];
        let rsp = self.regs().rsp;
        self.load(rsp, &mut b)?;
        match UTrapframe::from_bytes(&b) {
            Some(utf) => Ok(utf),
            None => Err(Fault::Killed),
        }
    }

    /// trampoline の後半: 汎用レジスタ / rflags / rsp / rip を trap 時点に戻す
    pub fn resume_from_upcall(&mut self, utf: &UTrapframe) {
        let tf = self.regs_mut();
        tf.regs = utf.regs;
        tf.rflags = utf.rflags;
        tf.rsp = utf.rsp;
        tf.rip = utf.rip;
    }
}
