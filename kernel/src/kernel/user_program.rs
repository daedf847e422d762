// kernel/src/kernel/user_program.rs
//
// 起動時に走らせる組み込み user プログラム。
//
// 役割:
// - ファイルシステムが無いので、最初の環境のイメージを実行時に ELF64 として組み立てる。
//
// やること（user 側の動き）:
// - sys_cputs でメッセージを出す
// - sys_yield を 1 回
// - sys_env_destroy(0) で自分を終わらせる（戻ってきたら無限ループ）
//
// やらないこと:
// - 汎用のアセンブラ（命令列は固定バイト）

use crate::mem::layout::UTEXT;
use crate::types::sysno;

use super::elf::{self, SegmentSpec, PF_R, PF_X};

pub const DEMO_MESSAGE: &[u8] = b"hello from user space\n";

/// 命令列の長さ。メッセージはこの直後に置く
pub(crate) const CODE_LEN: usize = 34;

/// イメージ全体が収まるバッファサイズ
pub const DEMO_IMAGE_MAX: usize = 512;

fn demo_text() -> [u8; CODE_LEN + DEMO_MESSAGE.len()] {
    let rel = (CODE_LEN - 7) as u32;
    let len = DEMO_MESSAGE.len() as u32;
    let yield_no = sysno::YIELD as u32;
    let destroy_no = sysno::ENV_DESTROY as u32;

    let mut t = [0u8; CODE_LEN + DEMO_MESSAGE.len()];
    let mut n = 0;
    let mut emit = |bytes: &[u8]| {
        t[n..n + bytes.len()].copy_from_slice(bytes);
        n += bytes.len();
    };

    // lea rdx, [rip + msg]
    emit(&[0x48, 0x8d, 0x15]);
    emit(&rel.to_le_bytes());
    // mov ecx, len
    emit(&[0xb9]);
    emit(&len.to_le_bytes());
    // xor eax, eax (cputs) ; int 0x30
    emit(&[0x31, 0xc0, 0xcd, 0x30]);
    // mov eax, yield ; int 0x30
    emit(&[0xb8]);
    emit(&yield_no.to_le_bytes());
    emit(&[0xcd, 0x30]);
    // mov eax, env_destroy ; xor edx, edx ; int 0x30
    emit(&[0xb8]);
    emit(&destroy_no.to_le_bytes());
    emit(&[0x31, 0xd2, 0xcd, 0x30]);
    // jmp $
    emit(&[0xeb, 0xfe]);
    emit(DEMO_MESSAGE);

    t
}

/// buf にデモイメージを書き、長さを返す
pub fn build_demo_image(buf: &mut [u8]) -> Option<usize> {
    let text = demo_text();
    elf::write_image(
        buf,
        UTEXT,
        &[SegmentSpec {
            vaddr: UTEXT,
            data: &text,
            memsz: text.len() as u64,
            flags: PF_R | PF_X,
        }],
    )
}
