// ulib/src/fork.rs
//
// copy-on-write fork
//
// 手順（親）:
// 1. COW handler を登録し、sys_exofork で空の子を作る
// 2. USTACKTOP 未満の user ページを UVPT 窓で列挙し、duppage で子へ写す
//    - 書き込み可能 / COW のページ: 子と自分の両方を COW|read-only でマップし直す
//    - それ以外: 同じ権限で共有
// 3. 子の例外スタックを新しく確保し、upcall を設定して Runnable にする
//
// 例外スタックは共有しない（子の最初の COW fault がそこに積まれるため）。

use exo_kernel::error::{Error, KResult};
use exo_kernel::mem::addr::{round_down, ENTRY_COUNT, PAGE_SIZE};
use exo_kernel::mem::layout::{
    uvpd_entry, uvpdp_entry, uvpml4_entry, uvpt_entry, PFTEMP, USTACKTOP, UVPT_PML4_INDEX, UXSTACKTOP,
};
use exo_kernel::mem::paging::{PageFlags, Pte, PTE_SYSCALL};
use exo_kernel::types::{EnvId, EnvStatus, FaultCode, UTrapframe};

use crate::pgfault::set_pgfault_handler;
use crate::syscall::{
    env_destroy, env_set_pgfault_upcall, env_set_status, exofork, getenvid, page_alloc, page_map,
    page_unmap,
};
use crate::Context;

const COW_SHARE: PageFlags = PageFlags::PRESENT.union(PageFlags::USER).union(PageFlags::COW);
const PRIVATE: PageFlags = PageFlags::PRESENT
    .union(PageFlags::USER)
    .union(PageFlags::WRITABLE);

/// va の末端 PTE。上位テーブルが無ければ None（UVPT 窓を上から順に覗く）
pub fn pte_of(ctx: &mut dyn Context, va: u64) -> Option<Pte> {
    for entry in [uvpml4_entry(va), uvpdp_entry(va), uvpd_entry(va)] {
        if !Pte(ctx.read_word(entry)).is_present() {
            return None;
        }
    }
    let pte = Pte(ctx.read_word(uvpt_entry(va)));
    pte.is_present().then_some(pte)
}

/// COW ページへの書き込みだけを引き受ける handler
pub fn pgfault(ctx: &mut dyn Context, utf: &UTrapframe) -> KResult<()> {
    let addr = round_down(utf.fault_va);
    let err = FaultCode::from_bits_truncate(utf.err);
    if !err.contains(FaultCode::WRITE) {
        ctx.puts("pgfault: faulting access was not a write\n");
        return Err(Error::Inval);
    }
    let is_cow = pte_of(ctx, addr).is_some_and(|pte| pte.flags().contains(PageFlags::COW));
    if !is_cow {
        ctx.puts("pgfault: write to a page that is not copy-on-write\n");
        return Err(Error::Inval);
    }

    page_alloc(ctx, EnvId::CURRENT, PFTEMP, PRIVATE)?;
    ctx.copy_page(PFTEMP, addr);
    page_map(ctx, EnvId::CURRENT, PFTEMP, EnvId::CURRENT, addr, PRIVATE)?;
    page_unmap(ctx, EnvId::CURRENT, PFTEMP)
}

/// 自分の va のページを子の同じ va へ写す
fn duppage(ctx: &mut dyn Context, child: EnvId, va: u64, pte: Pte) -> KResult<()> {
    let flags = pte.flags();
    if flags.intersects(PageFlags::WRITABLE | PageFlags::COW) {
        // 必ず子 → 自分の順
        page_map(ctx, EnvId::CURRENT, va, child, va, COW_SHARE)?;
        page_map(ctx, EnvId::CURRENT, va, EnvId::CURRENT, va, COW_SHARE)
    } else {
        page_map(ctx, EnvId::CURRENT, va, child, va, flags & PTE_SYSCALL)
    }
}

/// USTACKTOP 未満のマップ済み user ページを列挙して duppage する
fn copy_address_space(ctx: &mut dyn Context, child: EnvId) -> KResult<()> {
    const SPAN3: u64 = 1 << 30;
    const SPAN2: u64 = 1 << 21;

    for l4 in 0..UVPT_PML4_INDEX as u64 {
        let base4 = l4 << 39;
        if base4 >= USTACKTOP {
            break;
        }
        if !Pte(ctx.read_word(uvpml4_entry(base4))).is_present() {
            continue;
        }
        for l3 in 0..ENTRY_COUNT as u64 {
            let base3 = base4 + l3 * SPAN3;
            if base3 >= USTACKTOP {
                break;
            }
            if !Pte(ctx.read_word(uvpdp_entry(base3))).is_present() {
                continue;
            }
            for l2 in 0..ENTRY_COUNT as u64 {
                let base2 = base3 + l2 * SPAN2;
                if base2 >= USTACKTOP {
                    break;
                }
                if !Pte(ctx.read_word(uvpd_entry(base2))).is_present() {
                    continue;
                }
                for l1 in 0..ENTRY_COUNT as u64 {
                    let va = base2 + l1 * PAGE_SIZE;
                    if va >= USTACKTOP {
                        break;
                    }
                    let pte = Pte(ctx.read_word(uvpt_entry(va)));
                    if pte.flags().contains(PageFlags::PRESENT | PageFlags::USER) {
                        duppage(ctx, child, va, pte)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn setup_child(ctx: &mut dyn Context, child: EnvId) -> KResult<()> {
    copy_address_space(ctx, child)?;
    page_alloc(ctx, child, UXSTACKTOP - PAGE_SIZE, PRIVATE)?;
    let entry = ctx.upcall_entry();
    env_set_pgfault_upcall(ctx, child, entry)?;
    env_set_status(ctx, child, EnvStatus::Runnable)
}

/// 親には子の id、子には EnvId(0) を返す
pub fn fork(ctx: &mut dyn Context) -> KResult<EnvId> {
    set_pgfault_handler(ctx, pgfault)?;

    let child = exofork(ctx)?;
    if child.is_current() {
        let me = getenvid(ctx);
        ctx.set_thisenv(me);
        return Ok(EnvId::CURRENT);
    }

    match setup_child(ctx, child) {
        Ok(()) => Ok(child),
        Err(e) => {
            let _ = env_destroy(ctx, child);
            Err(e)
        }
    }
}
