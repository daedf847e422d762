// kernel/src/kernel/ipc.rs
//
// IPC（非同期 try-send / ブロッキング recv）
// - 受信側は ipc_recv で眠り、送信側は相手が受信待ちのときだけ成功する（待たない）
// - 値（u32）と、任意でページ 1 枚のマップを渡す
// - 受信側の戻り値はレジスタで返す:
//     rax = 0, rdx = value, rcx = 送信元 EnvId, rbx = 実際に渡った perm（渡らなければ 0）
//
// 設計メモ:
// - 送信側の ipc_try_send はハンドルの親子チェックをしない（誰にでも送れる）
// - 複数の送信が競合しても、受信待ちを外すのは最初の 1 回だけ（残りは IpcNotRecv）

use crate::error::{Error, KResult};
use crate::mem::addr::{is_page_aligned, VirtAddr};
use crate::mem::layout::UTOP;
use crate::mem::paging::{check_syscall_perm, PageFlags, PTE_SYSCALL};
use crate::types::{EnvId, EnvStatus};

use super::hal::Hal;
use super::syscall::SysReturn;
use super::{Kernel, LogEvent};

impl<H: Hal> Kernel<H> {
    pub(crate) fn sys_ipc_try_send(
        &mut self,
        cur: usize,
        env: EnvId,
        value: u32,
        src_va: u64,
        perm: u64,
    ) -> KResult<i32> {
        let dst = self.envs.resolve(env, Some(cur), false)?;
        if !self.envs.get(dst).ipc_recving {
            return Err(Error::IpcNotRecv);
        }

        let mut sent_perm = PageFlags::empty();
        if src_va < UTOP {
            if !is_page_aligned(src_va) {
                return Err(Error::Inval);
            }
            let perm = check_syscall_perm(perm).ok_or(Error::Inval)?;

            let src_space = self.envs.get(cur).space.ok_or(Error::BadEnv)?;
            let (frame, src_flags) = src_space
                .lookup(&self.hal, VirtAddr(src_va))
                .ok_or(Error::Inval)?;
            if !(src_flags & PTE_SYSCALL).contains(perm) {
                return Err(Error::Inval);
            }

            let receiver = self.envs.get(dst);
            if let (Some(dstva), Some(dst_space)) = (receiver.ipc_dstva, receiver.space) {
                dst_space.insert(&mut self.hal, frame, VirtAddr(dstva), perm)?;
                sent_perm = perm;
            }
        }

        let from = self.envs.get(cur).id;
        let r = self.envs.get_mut(dst);
        r.ipc_recving = false;
        r.ipc_from = from;
        r.ipc_value = value;
        r.ipc_perm = sent_perm;
        r.status = EnvStatus::Runnable;

        r.tf.regs.rax = 0;
        r.tf.regs.rdx = value as u64;
        r.tf.regs.rcx = from.to_reg();
        r.tf.regs.rbx = sent_perm.bits();

        let to = r.id;
        self.push_event(LogEvent::IpcDelivered { from, to, value });
        Ok(0)
    }

    /// dst_va が UTOP 未満なら、そこにページを受け取る意思がある
    pub(crate) fn sys_ipc_recv(&mut self, cur: usize, dst_va: u64) -> SysReturn {
        if dst_va < UTOP && !is_page_aligned(dst_va) {
            return SysReturn::Value(Err(Error::Inval));
        }

        let e = self.envs.get_mut(cur);
        e.ipc_recving = true;
        e.ipc_dstva = (dst_va < UTOP).then_some(dst_va);
        e.status = EnvStatus::NotRunnable;
        SysReturn::Sleep
    }
}
