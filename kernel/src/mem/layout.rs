// kernel/src/mem/layout.rs
//
// x86_64 仮想アドレスレイアウト（環境 = user プロセスから見た形）
//
// 想定レイアウト:
//
//   0xffff_8000_0000_0000 ..
//     - kernel 空間（PML4 index 256..=511）。physmap / kernel image / kernel stack。
//     - 全環境で同一（kernel root のエントリをコピーする）。user からは見えない。
//
//   ULIM = 0x0000_8000_0000_0000
//   UVPT = 0x0000_7f80_0000_0000 .. ULIM   (PML4 index 255)
//     - 環境自身のページテーブルを read-only で見せる再帰スロット。
//
//   UTOP = UXSTACKTOP = UVPT
//     - [UXSTACKTOP - PAGE_SIZE, UXSTACKTOP) : 例外スタック（1 ページ）
//     - その下 1 ページは空き（ガード）
//   USTACKTOP = UTOP - 2 * PAGE_SIZE
//     - 通常の user スタック（下へ伸びる）
//
//   UTEXT = 0x0080_0000 : プログラムのロード先（慣例）
//   UTEMP = 0x0040_0000 : 一時マップ用
//   PFTEMP             : COW fault handler が使う scratch ページ
//   0 .. UTEMP         : 未使用（null 参照を拾う）

use crate::mem::addr::PAGE_SIZE;

/// 1つの PML4 エントリがカバーする仮想アドレス範囲（512GiB）
pub const PML4_SLOT_SIZE: u64 = 1u64 << 39;

/// 2MiB（PD エントリ 1 つ分）
pub const PTSIZE: u64 = 1u64 << 21;

/// 再帰マップに使う PML4 index
pub const UVPT_PML4_INDEX: usize = 255;

/// kernel 空間が始まる PML4 index
pub const KERNEL_PML4_START: usize = 256;

pub const ULIM: u64 = 0x0000_8000_0000_0000;
pub const UVPT: u64 = (UVPT_PML4_INDEX as u64) * PML4_SLOT_SIZE;
pub const UTOP: u64 = UVPT;
pub const UXSTACKTOP: u64 = UTOP;
pub const USTACKTOP: u64 = UTOP - 2 * PAGE_SIZE;

pub const UTEXT: u64 = 4 * PTSIZE;
pub const UTEMP: u64 = 2 * PTSIZE;
pub const PFTEMP: u64 = UTEMP + PTSIZE - PAGE_SIZE;

pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

// 再帰スロット経由で各レベルのテーブルを見る窓
const R: u64 = UVPT_PML4_INDEX as u64;
pub const UVPD: u64 = UVPT + (R << 30);
pub const UVPDP: u64 = UVPD + (R << 21);
pub const UVPML4: u64 = UVPDP + (R << 12);

/// va の PTE が見える UVPT 上のアドレス（va は low half 前提）
pub const fn uvpt_entry(va: u64) -> u64 {
    UVPT + ((va >> 12) << 3)
}

/// va の PDE が見えるアドレス
pub const fn uvpd_entry(va: u64) -> u64 {
    UVPD + ((va >> 21) << 3)
}

/// va の PDPTE が見えるアドレス
pub const fn uvpdp_entry(va: u64) -> u64 {
    UVPDP + ((va >> 30) << 3)
}

/// va の PML4E が見えるアドレス
pub const fn uvpml4_entry(va: u64) -> u64 {
    UVPML4 + ((va >> 39) << 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants_are_consistent() {
        assert_eq!(UTEXT, 0x80_0000);
        assert_eq!(UTEMP, 0x40_0000);
        assert_eq!(PFTEMP, 0x5f_f000);
        assert_eq!(UTOP, 0x0000_7f80_0000_0000);
        assert!(USTACKTOP < UXSTACKTOP - PAGE_SIZE);
    }

    #[test]
    fn recursive_windows_stay_inside_uvpt_slot() {
        let last_user = UTOP - 1;
        for addr in [
            uvpt_entry(last_user),
            uvpd_entry(last_user),
            uvpdp_entry(last_user),
            uvpml4_entry(last_user),
        ] {
            assert!(addr >= UVPT && addr < ULIM, "{addr:#x}");
        }
        assert_eq!(uvpml4_entry(0), UVPML4);
    }
}
