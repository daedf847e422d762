// kernel/src/kernel/syscall.rs
//
// syscall 境界
// - rax の番号と 5 引数を Syscall に decode し、ハンドラへ振り分ける
// - 結果は i32（負ならエラー）で rax に戻る。ipc_recv の成功と yield だけは特別扱い
//
// トレース（feature で切替）
// - syscall_trace: decode 済みの Syscall を 1 行ずつ出す
//
// 設計方針:
// - ハンドル解決は EnvTable::resolve に一本化（0 = 自分、checkperm = 自分か直接の子）
// - user メモリを読むものは user_mem_check を通してから物理窓でコピーする
// - 失敗はすべて Err を返すだけで、呼び出し元の環境は殺さない

use crate::error::{Error, KResult};
use crate::logging;
use crate::mem::addr::{is_page_aligned, VirtAddr};
use crate::mem::layout::{ULIM, UTOP};
use crate::mem::paging::{check_syscall_perm, PageFlags};
use crate::types::{
    sysno, EnvId, EnvStatus, TrapFrame, FL_IF, FL_RESERVED, GD_UD, GD_UT, RPL_USER,
};

use super::hal::{CpuId, Hal};
use super::Kernel;

/// set_trapframe で user が持ち込める RFLAGS（CF PF AF ZF SF TF DF OF AC）
const USER_RFLAGS_MASK: u64 = 0x0000_0000_0004_0dd5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    Cputs { va: u64, len: u64 },
    Cgetc,
    GetEnvId,
    EnvDestroy { env: EnvId },
    PageAlloc { env: EnvId, va: u64, perm: u64 },
    PageMap { src_env: EnvId, src_va: u64, dst_env: EnvId, dst_va: u64, perm: u64 },
    PageUnmap { env: EnvId, va: u64 },
    Exofork,
    EnvSetStatus { env: EnvId, status: u64 },
    EnvSetTrapframe { env: EnvId, tf_va: u64 },
    EnvSetPgfaultUpcall { env: EnvId, upcall: u64 },
    Yield,
    IpcTrySend { env: EnvId, value: u32, src_va: u64, perm: u64 },
    IpcRecv { dst_va: u64 },
}

impl Syscall {
    /// 未知の番号は Inval、ハンドルとして読めないレジスタは BadEnv
    pub fn decode(no: u64, a: [u64; 5]) -> KResult<Syscall> {
        let env = |reg: u64| EnvId::from_reg(reg).ok_or(Error::BadEnv);
        Ok(match no {
            sysno::CPUTS => Syscall::Cputs { va: a[0], len: a[1] },
            sysno::CGETC => Syscall::Cgetc,
            sysno::GETENVID => Syscall::GetEnvId,
            sysno::ENV_DESTROY => Syscall::EnvDestroy { env: env(a[0])? },
            sysno::PAGE_ALLOC => Syscall::PageAlloc {
                env: env(a[0])?,
                va: a[1],
                perm: a[2],
            },
            sysno::PAGE_MAP => Syscall::PageMap {
                src_env: env(a[0])?,
                src_va: a[1],
                dst_env: env(a[2])?,
                dst_va: a[3],
                perm: a[4],
            },
            sysno::PAGE_UNMAP => Syscall::PageUnmap {
                env: env(a[0])?,
                va: a[1],
            },
            sysno::EXOFORK => Syscall::Exofork,
            sysno::ENV_SET_STATUS => Syscall::EnvSetStatus {
                env: env(a[0])?,
                status: a[1],
            },
            sysno::ENV_SET_TRAPFRAME => Syscall::EnvSetTrapframe {
                env: env(a[0])?,
                tf_va: a[1],
            },
            sysno::ENV_SET_PGFAULT_UPCALL => Syscall::EnvSetPgfaultUpcall {
                env: env(a[0])?,
                upcall: a[1],
            },
            sysno::YIELD => Syscall::Yield,
            sysno::IPC_TRY_SEND => Syscall::IpcTrySend {
                env: env(a[0])?,
                value: a[1] as u32,
                src_va: a[2],
                perm: a[3],
            },
            sysno::IPC_RECV => Syscall::IpcRecv { dst_va: a[0] },
            _ => return Err(Error::Inval),
        })
    }
}

/// ハンドラの戻り方
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SysReturn {
    /// rax に載せて戻る
    Value(KResult<i32>),
    /// rax = 0 で、scheduler に回す
    Yield,
    /// 眠る。rax は送り手が書く
    Sleep,
}

/// user 空間のページ境界アドレスか（UTOP 未満）
fn user_page_va(va: u64) -> KResult<VirtAddr> {
    if va >= UTOP || !is_page_aligned(va) {
        return Err(Error::Inval);
    }
    Ok(VirtAddr(va))
}

/// user から持ち込まれた TrapFrame を、user 特権でしか走れない形に直す
pub fn sanitize_user_trapframe(mut tf: TrapFrame) -> KResult<TrapFrame> {
    if tf.rip >= ULIM || tf.rsp >= ULIM {
        return Err(Error::Inval);
    }
    let data = (GD_UD | RPL_USER) as u64;
    tf.cs = (GD_UT | RPL_USER) as u64;
    tf.ss = data;
    tf.ds = data;
    tf.es = data;
    tf.rflags = (tf.rflags & USER_RFLAGS_MASK) | FL_IF | FL_RESERVED;
    tf.trapno = 0;
    tf.err = 0;
    Ok(tf)
}

impl<H: Hal> Kernel<H> {
    pub(crate) fn syscall(&mut self, cpu: CpuId, cur: usize, call: Syscall) -> SysReturn {
        #[cfg(feature = "syscall_trace")]
        logging::info_fmt(format_args!("[{}] syscall {:?}", self.envs.get(cur).id, call));

        let r = match call {
            Syscall::Cputs { va, len } => self.sys_cputs(cur, va, len),
            Syscall::Cgetc => Ok(self.hal.console_getc().map(i32::from).unwrap_or(0)),
            Syscall::GetEnvId => Ok(self.envs.get(cur).id.0),
            Syscall::EnvDestroy { env } => self.sys_env_destroy(cpu, cur, env),
            Syscall::PageAlloc { env, va, perm } => self.sys_page_alloc(cur, env, va, perm),
            Syscall::PageMap {
                src_env,
                src_va,
                dst_env,
                dst_va,
                perm,
            } => self.sys_page_map(cur, src_env, src_va, dst_env, dst_va, perm),
            Syscall::PageUnmap { env, va } => self.sys_page_unmap(cur, env, va),
            Syscall::Exofork => self.sys_exofork(cur),
            Syscall::EnvSetStatus { env, status } => self.sys_env_set_status(cur, env, status),
            Syscall::EnvSetTrapframe { env, tf_va } => self.sys_env_set_trapframe(cur, env, tf_va),
            Syscall::EnvSetPgfaultUpcall { env, upcall } => {
                self.sys_env_set_pgfault_upcall(cur, env, upcall)
            }
            Syscall::Yield => return SysReturn::Yield,
            Syscall::IpcTrySend {
                env,
                value,
                src_va,
                perm,
            } => self.sys_ipc_try_send(cur, env, value, src_va, perm),
            Syscall::IpcRecv { dst_va } => return self.sys_ipc_recv(cur, dst_va),
        };
        SysReturn::Value(r)
    }

    fn sys_cputs(&mut self, cur: usize, va: u64, len: u64) -> KResult<i32> {
        self.user_mem_assert(cur, va, len, PageFlags::empty())?;

        let mut buf = [0u8; 256];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(buf.len() as u64) as usize;
            self.copy_from_user(cur, va + done, &mut buf[..n])?;
            self.hal.console_write(&buf[..n]);
            done += n as u64;
        }
        Ok(0)
    }

    fn sys_env_destroy(&mut self, cpu: CpuId, cur: usize, env: EnvId) -> KResult<i32> {
        let idx = self.envs.resolve(env, Some(cur), true)?;
        let me = self.envs.get(cur).id;
        if idx == cur {
            logging::info_fmt(format_args!("[{}] exiting gracefully", me));
        } else {
            logging::info_fmt(format_args!("[{}] destroying {}", me, self.envs.get(idx).id));
        }
        self.env_destroy(cpu, idx);
        Ok(0)
    }

    /// 子は NotRunnable、レジスタは親のコピーで rax だけ 0
    fn sys_exofork(&mut self, cur: usize) -> KResult<i32> {
        let parent = *self.envs.get(cur);
        let idx = self.env_alloc(parent.id)?;

        let child = self.envs.get_mut(idx);
        child.status = EnvStatus::NotRunnable;
        child.tf = parent.tf;
        child.tf.regs.rax = 0;
        Ok(child.id.0)
    }

    fn sys_env_set_status(&mut self, cur: usize, env: EnvId, status: u64) -> KResult<i32> {
        let status = match EnvStatus::from_raw(status) {
            Some(s @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => s,
            _ => return Err(Error::Inval),
        };
        let idx = self.envs.resolve(env, Some(cur), true)?;
        let e = self.envs.get(idx);
        let next = match (e.status, status) {
            // 回収待ちは取り消さない
            (EnvStatus::Dying, _) => EnvStatus::Dying,
            // どこかの CPU の current は Running のまま（scheduler の候補に戻さない）
            (_, EnvStatus::Runnable) if self.is_current_anywhere(idx) => EnvStatus::Running,
            (_, s) => s,
        };
        self.envs.get_mut(idx).status = next;
        Ok(0)
    }

    fn sys_env_set_trapframe(&mut self, cur: usize, env: EnvId, tf_va: u64) -> KResult<i32> {
        let idx = self.envs.resolve(env, Some(cur), true)?;

        let size = core::mem::size_of::<TrapFrame>();
        self.user_mem_assert(cur, tf_va, size as u64, PageFlags::empty())?;

        let mut raw = [0u8; core::mem::size_of::<TrapFrame>()];
        self.copy_from_user(cur, tf_va, &mut raw)?;
        // Safety: 長さは TrapFrame と同じ。u64 だけの repr(C)
        let tf: TrapFrame = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const TrapFrame) };

        self.envs.get_mut(idx).tf = sanitize_user_trapframe(tf)?;
        Ok(0)
    }

    fn sys_env_set_pgfault_upcall(&mut self, cur: usize, env: EnvId, upcall: u64) -> KResult<i32> {
        let idx = self.envs.resolve(env, Some(cur), true)?;
        self.envs.get_mut(idx).pgfault_upcall = (upcall != 0).then_some(upcall);
        Ok(0)
    }

    fn sys_page_alloc(&mut self, cur: usize, env: EnvId, va: u64, perm: u64) -> KResult<i32> {
        let idx = self.envs.resolve(env, Some(cur), true)?;
        let va = user_page_va(va)?;
        let perm = check_syscall_perm(perm).ok_or(Error::Inval)?;
        let space = self.envs.get(idx).space.ok_or(Error::BadEnv)?;

        let frame = self.hal.alloc_page().ok_or(Error::NoMem)?;
        if let Err(e) = space.insert(&mut self.hal, frame, va, perm) {
            self.hal.decref(frame);
            return Err(e);
        }
        Ok(0)
    }

    fn sys_page_map(
        &mut self,
        cur: usize,
        src_env: EnvId,
        src_va: u64,
        dst_env: EnvId,
        dst_va: u64,
        perm: u64,
    ) -> KResult<i32> {
        let src = self.envs.resolve(src_env, Some(cur), true)?;
        let dst = self.envs.resolve(dst_env, Some(cur), true)?;
        let src_va = user_page_va(src_va)?;
        let dst_va = user_page_va(dst_va)?;
        let perm = check_syscall_perm(perm).ok_or(Error::Inval)?;

        let src_space = self.envs.get(src).space.ok_or(Error::BadEnv)?;
        let dst_space = self.envs.get(dst).space.ok_or(Error::BadEnv)?;

        let (frame, src_flags) = src_space.lookup(&self.hal, src_va).ok_or(Error::Inval)?;
        if perm.contains(PageFlags::WRITABLE) && !src_flags.contains(PageFlags::WRITABLE) {
            return Err(Error::Inval);
        }

        dst_space.insert(&mut self.hal, frame, dst_va, perm)?;
        Ok(0)
    }

    fn sys_page_unmap(&mut self, cur: usize, env: EnvId, va: u64) -> KResult<i32> {
        let idx = self.envs.resolve(env, Some(cur), true)?;
        let va = user_page_va(va)?;
        let space = self.envs.get(idx).space.ok_or(Error::BadEnv)?;
        space.remove(&mut self.hal, va);
        Ok(0)
    }
}

#[cfg(test)]
mod tests_prop;
