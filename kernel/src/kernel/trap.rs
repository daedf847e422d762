// kernel/src/kernel/trap.rs
//
// 役割:
// - 全 trap（例外 / 割り込み / syscall）の単一入口 Kernel::trap()。
//
// やること:
// - user から来た trap なら: Dying な current を回収、frame を current に保存
// - 種別ごとの処理（page fault upcall / breakpoint / syscall / timer / spurious）
// - 最後に current を再開するか scheduler に回すかを決めて Dispatch を返す
//
// やらないこと:
// - ロックの取得と解放、他 CPU の panic 検知（arch 側の入口でやる）
//
// 設計方針:
// - kernel モードでの page fault と想定外 trap は fail-stop（panic）。
// - user モードの想定外 trap はその環境を破棄するだけ。

use crate::error::result_to_reg;
use crate::logging;
use crate::mem::addr::PAGE_SIZE;
use crate::mem::layout::UXSTACKTOP;
use crate::mem::paging::PageFlags;
use crate::types::{
    EnvStatus, FaultCode, TrapFrame, UTrapframe, IRQ_OFFSET, IRQ_SPURIOUS, IRQ_TIMER, T_BRKPT,
    T_PGFLT, T_SYSCALL, UTRAPFRAME_GAP, UTRAPFRAME_SIZE,
};

use super::hal::{CpuId, Hal};
use super::syscall::{SysReturn, Syscall};
use super::{CpuStatus, Dispatch, Kernel, LogEvent};

/// trap 番号の分類
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    PageFault,
    Breakpoint,
    Syscall,
    Timer,
    Spurious,
    /// その他の外部割り込み（IRQ 番号）
    Irq(u8),
    /// その他の CPU 例外（trap 番号）
    Exception(u64),
}

impl TrapKind {
    pub fn classify(trapno: u64) -> TrapKind {
        match trapno {
            T_PGFLT => TrapKind::PageFault,
            T_BRKPT => TrapKind::Breakpoint,
            T_SYSCALL => TrapKind::Syscall,
            n if n == IRQ_OFFSET + IRQ_TIMER => TrapKind::Timer,
            n if n == IRQ_OFFSET + IRQ_SPURIOUS => TrapKind::Spurious,
            n if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&n) => TrapKind::Irq((n - IRQ_OFFSET) as u8),
            n => TrapKind::Exception(n),
        }
    }
}

pub fn trapname(trapno: u64) -> &'static str {
    const EXCNAMES: [&str; 20] = [
        "Divide error",
        "Debug",
        "Non-Maskable Interrupt",
        "Breakpoint",
        "Overflow",
        "BOUND Range Exceeded",
        "Invalid Opcode",
        "Device Not Available",
        "Double Fault",
        "Coprocessor Segment Overrun",
        "Invalid TSS",
        "Segment Not Present",
        "Stack Fault",
        "General Protection",
        "Page Fault",
        "(unknown trap)",
        "x87 FPU Floating-Point Error",
        "Alignment Check",
        "Machine-Check",
        "SIMD Floating-Point Exception",
    ];

    if let Some(name) = EXCNAMES.get(trapno as usize) {
        return name;
    }
    if trapno == T_SYSCALL {
        return "System call";
    }
    if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&trapno) {
        return "Hardware Interrupt";
    }
    "(unknown trap)"
}

/// frame をログへ出す
pub fn print_trapframe(cpu: CpuId, tf: &TrapFrame, fault_va: Option<u64>) {
    let r = &tf.regs;
    logging::info_fmt(format_args!("TRAP frame from CPU {}", cpu.0));
    for (name, v) in [
        ("r15", r.r15),
        ("r14", r.r14),
        ("r13", r.r13),
        ("r12", r.r12),
        ("r11", r.r11),
        ("r10", r.r10),
        ("r9 ", r.r9),
        ("r8 ", r.r8),
        ("rdi", r.rdi),
        ("rsi", r.rsi),
        ("rbp", r.rbp),
        ("rbx", r.rbx),
        ("rdx", r.rdx),
        ("rcx", r.rcx),
        ("rax", r.rax),
    ] {
        logging::info_fmt(format_args!("  {}  {:#018x}", name, v));
    }
    logging::info_fmt(format_args!("  es   0x----{:04x}", tf.es));
    logging::info_fmt(format_args!("  ds   0x----{:04x}", tf.ds));
    logging::info_fmt(format_args!("  trap {:#010x} {}", tf.trapno, trapname(tf.trapno)));
    if tf.trapno == T_PGFLT {
        if let Some(va) = fault_va {
            logging::info_fmt(format_args!("  cr2  {:#018x}", va));
        }
        let err = FaultCode::from_bits_truncate(tf.err);
        logging::info_fmt(format_args!(
            "  err  {:#010x} [{}, {}, {}]",
            tf.err,
            if err.contains(FaultCode::USER) { "user" } else { "kernel" },
            if err.contains(FaultCode::WRITE) { "write" } else { "read" },
            if err.contains(FaultCode::PROTECTION) { "protection" } else { "not-present" },
        ));
    } else {
        logging::info_fmt(format_args!("  err  {:#010x}", tf.err));
    }
    logging::info_fmt(format_args!("  rip  {:#018x}", tf.rip));
    logging::info_fmt(format_args!("  cs   0x----{:04x}", tf.cs));
    logging::info_fmt(format_args!("  flag {:#010x}", tf.rflags));
    if tf.from_user() {
        logging::info_fmt(format_args!("  rsp  {:#018x}", tf.rsp));
        logging::info_fmt(format_args!("  ss   0x----{:04x}", tf.ss));
    }
}

/// 種別処理のあと、どう続けるか
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// current がまだ Running ならそのまま戻る
    Continue,
    /// current が Running でも scheduler に回す
    Reschedule,
}

impl<H: Hal> Kernel<H> {
    /// 全 trap の入口。呼び出し時点で big kernel lock（&mut self）を持っていること。
    pub fn trap(&mut self, cpu: CpuId, tf: &TrapFrame) -> Dispatch {
        let c = cpu.index();
        if self.cpus[c].status == CpuStatus::Halted {
            self.cpus[c].status = CpuStatus::Started;
        }

        #[cfg(feature = "trap_trace")]
        logging::info_fmt(format_args!(
            "trap: cpu {} trapno {:#x} ({}) rip {:#x}",
            c,
            tf.trapno,
            trapname(tf.trapno),
            tf.rip
        ));

        let from_user = tf.from_user();
        if from_user {
            let Some(cur) = self.cpus[c].cur else {
                panic!("trap from user mode with no current env on cpu {}", c);
            };

            if self.envs.get(cur).status == EnvStatus::Dying {
                self.env_free(cpu, cur);
                self.cpus[c].cur = None;
                return self.sched_yield(cpu);
            }

            self.envs.get_mut(cur).tf = *tf;
        }

        let step = self.trap_dispatch(cpu, tf, from_user);

        match self.cpus[c].cur {
            Some(cur) if step == Step::Continue && self.envs.get(cur).status == EnvStatus::Running => {
                self.env_run(cpu, cur)
            }
            _ => self.sched_yield(cpu),
        }
    }

    fn trap_dispatch(&mut self, cpu: CpuId, tf: &TrapFrame, from_user: bool) -> Step {
        match TrapKind::classify(tf.trapno) {
            TrapKind::Spurious => {
                logging::info("Spurious interrupt on irq 7");
                print_trapframe(cpu, tf, None);
                Step::Continue
            }
            TrapKind::Timer => {
                self.hal.end_of_interrupt(IRQ_TIMER as u8);
                Step::Reschedule
            }
            TrapKind::Irq(irq) => {
                self.hal.end_of_interrupt(irq);
                Step::Continue
            }
            TrapKind::PageFault => {
                self.page_fault(cpu, tf);
                Step::Continue
            }
            TrapKind::Breakpoint => {
                self.hal.monitor(tf);
                Step::Continue
            }
            TrapKind::Syscall if from_user => self.dispatch_syscall(cpu),
            TrapKind::Syscall | TrapKind::Exception(_) => {
                print_trapframe(cpu, tf, None);
                if !from_user {
                    panic!("unhandled trap in kernel");
                }
                if let Some(cur) = self.cpus[cpu.index()].cur {
                    self.env_destroy(cpu, cur);
                }
                Step::Continue
            }
        }
    }

    fn dispatch_syscall(&mut self, cpu: CpuId) -> Step {
        let Some(cur) = self.cpus[cpu.index()].cur else {
            return Step::Continue;
        };
        let (no, args) = self.envs.get(cur).tf.syscall_args();

        let ret = match Syscall::decode(no, args) {
            Ok(call) => self.syscall(cpu, cur, call),
            Err(e) => SysReturn::Value(Err(e)),
        };

        match ret {
            SysReturn::Value(r) => {
                // 自分を破棄した場合は書き戻す先が無い
                if self.cpus[cpu.index()].cur == Some(cur) {
                    self.envs.get_mut(cur).tf.regs.rax = result_to_reg(r);
                }
                Step::Continue
            }
            SysReturn::Yield => {
                self.envs.get_mut(cur).tf.regs.rax = 0;
                Step::Reschedule
            }
            SysReturn::Sleep => Step::Continue,
        }
    }

    //
    // page fault: upcall があれば例外スタックに UTrapframe を積んでそこへ飛ばす
    //
    fn page_fault(&mut self, cpu: CpuId, tf: &TrapFrame) {
        let fault_va = self.hal.fault_address();

        if !tf.from_user() {
            print_trapframe(cpu, tf, Some(fault_va));
            panic!("kernel page fault at va {:#x} ip {:#x}", fault_va, tf.rip);
        }

        let Some(cur) = self.cpus[cpu.index()].cur else {
            panic!("user page fault with no current env");
        };
        let env = *self.envs.get(cur);

        let Some(upcall) = env.pgfault_upcall else {
            logging::info_fmt(format_args!(
                "[{}] user fault va {:08x} ip {:08x}",
                env.id, fault_va, env.tf.rip
            ));
            print_trapframe(cpu, tf, Some(fault_va));
            self.push_event(LogEvent::UserFaultKilled { env: env.id, fault_va });
            self.env_destroy(cpu, cur);
            return;
        };

        let exstack_bottom = UXSTACKTOP - PAGE_SIZE;
        let top = if (exstack_bottom..UXSTACKTOP).contains(&env.tf.rsp) {
            env.tf.rsp - UTRAPFRAME_GAP
        } else {
            UXSTACKTOP
        };
        let utf_va = top.wrapping_sub(UTRAPFRAME_SIZE);

        let fits = top >= exstack_bottom + UTRAPFRAME_SIZE;
        if !fits || self.user_mem_assert(cur, utf_va, UTRAPFRAME_SIZE, PageFlags::WRITABLE).is_err() {
            if !fits {
                logging::info_fmt(format_args!(
                    "[{}] user_mem_check assertion failure for va {:08x}",
                    env.id, utf_va
                ));
            }
            self.push_event(LogEvent::UserFaultKilled { env: env.id, fault_va });
            self.env_destroy(cpu, cur);
            return;
        }

        let utf = UTrapframe {
            fault_va,
            err: tf.err,
            regs: env.tf.regs,
            rip: env.tf.rip,
            rflags: env.tf.rflags,
            rsp: env.tf.rsp,
        };
        if self.copy_to_user(cur, utf_va, utf.as_bytes()).is_err() {
            self.env_destroy(cpu, cur);
            return;
        }

        let e = self.envs.get_mut(cur);
        e.tf.rip = upcall;
        e.tf.rsp = utf_va;
        self.push_event(LogEvent::PageFaultUpcall {
            env: env.id,
            fault_va,
            utf_va,
        });
    }
}
