// src/mem/addr.rs
//
// 役割:
// - アドレスとフレーム番号に型を付ける。
// やること:
// - ページ境界の丸め（溢れは None）と、4-level walk の各段の index 計算
// やらないこと:
// - ページテーブルの読み書き（mem::address_space）

use core::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct PhysAddr(pub u64);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct VirtAddr(pub u64);

pub const PAGE_SIZE: u64 = 4096;
const PAGE_SHIFT: u64 = 12;

/// 1 テーブルあたりのエントリ数
pub const ENTRY_COUNT: usize = 512;

/// 物理フレーム番号（phys_addr / PAGE_SIZE）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysFrame {
    pub number: u64,
}

pub const fn round_down(x: u64) -> u64 {
    x & !(PAGE_SIZE - 1)
}

/// 溢れたら None
pub const fn round_up(x: u64) -> Option<u64> {
    match x.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(round_down(v)),
        None => None,
    }
}

pub const fn is_page_aligned(x: u64) -> bool {
    x & (PAGE_SIZE - 1) == 0
}

impl PhysAddr {
    pub fn frame(self) -> PhysFrame {
        PhysFrame {
            number: self.0 >> PAGE_SHIFT,
        }
    }
}

impl VirtAddr {
    pub fn align_down(self) -> VirtAddr {
        VirtAddr(round_down(self.0))
    }

    pub fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE - 1)) as usize
    }

    /// level 4 = PML4, 3 = PDPT, 2 = PD, 1 = PT
    pub fn table_index(self, level: u8) -> usize {
        let shift = PAGE_SHIFT + 9 * (level as u64 - 1);
        ((self.0 >> shift) & 0x1ff) as usize
    }
}

impl PhysFrame {
    pub fn start_address(self) -> PhysAddr {
        PhysAddr(self.number << PAGE_SHIFT)
    }

    pub const fn from_index(number: u64) -> Self {
        PhysFrame { number }
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.start_address().0)
    }
}
