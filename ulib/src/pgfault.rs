// ulib/src/pgfault.rs
//
// user レベル page fault handler の登録と呼び出し。
//
// - 初回登録時に例外スタック（UXSTACKTOP 直下の 1 ページ）を確保し、kernel に upcall 入口を教える
// - kernel は UTrapframe を例外スタックに積んで upcall 入口へ飛ばす。入口（trampoline）は
//   dispatch() を呼び、戻ってきたら UTrapframe の状態で fault した命令から再開する
// - handler が失敗したらメッセージを出して自分を破棄する

use exo_kernel::error::KResult;
use exo_kernel::mem::addr::PAGE_SIZE;
use exo_kernel::mem::layout::UXSTACKTOP;
use exo_kernel::mem::paging::PageFlags;
use exo_kernel::types::{EnvId, UTrapframe};

use crate::syscall::{env_destroy, env_set_pgfault_upcall, page_alloc};
use crate::Context;

pub type PgfaultHandler = fn(&mut dyn Context, &UTrapframe) -> KResult<()>;

pub fn set_pgfault_handler(ctx: &mut dyn Context, handler: PgfaultHandler) -> KResult<()> {
    if ctx.handler().is_none() {
        page_alloc(
            ctx,
            EnvId::CURRENT,
            UXSTACKTOP - PAGE_SIZE,
            PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE,
        )?;
        let entry = ctx.upcall_entry();
        env_set_pgfault_upcall(ctx, EnvId::CURRENT, entry)?;
    }
    ctx.set_handler(handler);
    Ok(())
}

/// upcall 入口から呼ばれる。戻ったら fault 時点へ復帰してよい。
pub fn dispatch(ctx: &mut dyn Context, utf: &UTrapframe) {
    let result = match ctx.handler() {
        Some(handler) => handler(ctx, utf),
        None => {
            ctx.puts("user panic: page fault with no handler installed\n");
            let _ = env_destroy(ctx, EnvId::CURRENT);
            return;
        }
    };

    if let Err(e) = result {
        ctx.puts("user panic: page fault handler failed: ");
        ctx.puts(e.as_str());
        ctx.puts("\n");
        let _ = env_destroy(ctx, EnvId::CURRENT);
    }
}
