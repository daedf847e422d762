// kernel/src/mem/paging.rs
//
// ページテーブルエントリ（x86_64 4-level 形式）と属性ビット。

use crate::mem::addr::{PhysAddr, PhysFrame};

bitflags::bitflags! {
    /// ページ属性（x86_64 の PTE ビットそのもの）
    ///
    /// - PRESENT: ページが有効
    /// - WRITABLE: 書き込み可能
    /// - USER: ユーザ空間からアクセス可能
    /// - COW: available bit 9 を user 空間が copy-on-write 印として使う
    /// - NO_EXEC: 実行禁止（NX bit 相当）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// PDPT/PD レベルでの huge page
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const COW = 1 << 9;
        const NO_EXEC = 1 << 63;
    }
}

/// syscall で user が指定してよいビット
pub const PTE_SYSCALL: PageFlags = PageFlags::PRESENT
    .union(PageFlags::WRITABLE)
    .union(PageFlags::USER)
    .union(PageFlags::COW);

/// 中間テーブル（PML4E/PDPTE/PDE）に付ける属性。権限は末端 PTE で絞る。
pub const TABLE_FLAGS: PageFlags = PageFlags::PRESENT
    .union(PageFlags::WRITABLE)
    .union(PageFlags::USER);

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// syscall 由来の perm 検査。
/// - PRESENT|USER 必須、PTE_SYSCALL 外のビットは不可
pub fn check_syscall_perm(raw: u64) -> Option<PageFlags> {
    let perm = PageFlags::from_bits(raw)?;
    if !PTE_SYSCALL.contains(perm) {
        return None;
    }
    if !perm.contains(PageFlags::PRESENT | PageFlags::USER) {
        return None;
    }
    Some(perm)
}

/// 1 エントリ分の生値
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(pub u64);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: PhysFrame, flags: PageFlags) -> Pte {
        Pte((frame.start_address().0 & ADDR_MASK) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn frame(self) -> PhysFrame {
        PhysAddr(self.0 & ADDR_MASK).frame()
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#x}, {:?})", self.frame().start_address().0, self.flags())
    }
}
