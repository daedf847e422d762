// src/mm/mod.rs
//
// 物理メモリ管理の入り口。
// - PhysMemory: カーネル本体が使う「ページ確保 / 参照カウント / 中身アクセス」の境界。
// - 実機では BootInfo::memory_map の Usable 領域を FrameTable に登録して使う。
// - host では hosted::SimHal が同じ trait を実装する。

pub mod frame_table;

use crate::mem::addr::{PhysFrame, ENTRY_COUNT};

pub use frame_table::{FrameTable, PageInfo};

pub const PAGE_BYTES: usize = 4096;

/// 物理ページ 1 枚分の中身
#[repr(C, align(4096))]
pub struct Page {
    pub bytes: [u8; PAGE_BYTES],
}

static_assertions::assert_eq_size!(Page, [u64; ENTRY_COUNT]);

impl Page {
    pub const fn zeroed() -> Self {
        Page {
            bytes: [0; PAGE_BYTES],
        }
    }

    /// ページテーブルとして見る
    pub fn entries(&self) -> &[u64; ENTRY_COUNT] {
        // Safety: 4096 align / 同サイズ / u64 は全ビットパターン有効
        unsafe { &*(self as *const Page as *const [u64; ENTRY_COUNT]) }
    }

    pub fn entries_mut(&mut self) -> &mut [u64; ENTRY_COUNT] {
        // Safety: 同上
        unsafe { &mut *(self as *mut Page as *mut [u64; ENTRY_COUNT]) }
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

/// 物理ページアロケータ + 物理窓アクセス。
///
/// - alloc_page(): ゼロ埋め済みページを返す。refs は 0（マップした側が incref する）。
/// - incref(): 参照カウントが上限なら false（何も変えない）。
/// - decref(): 0 になったら解放する。
pub trait PhysMemory {
    fn alloc_page(&mut self) -> Option<PhysFrame>;
    fn incref(&mut self, frame: PhysFrame) -> bool;
    fn decref(&mut self, frame: PhysFrame);
    fn ref_count(&self, frame: PhysFrame) -> u16;
    fn free_pages(&self) -> usize;

    fn page(&self, frame: PhysFrame) -> &Page;
    fn page_mut(&mut self, frame: PhysFrame) -> &mut Page;
}

#[cfg(target_os = "none")]
pub use boot::PhysicalMemoryManager;

#[cfg(target_os = "none")]
mod boot {
    use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
    use bootloader::BootInfo;

    use super::{FrameTable, Page, PageInfo, PhysMemory};
    use crate::mem::addr::{PhysAddr, PhysFrame, PAGE_SIZE};

    /// 管理する物理メモリの上限（256MiB 分）
    pub const MAX_FRAMES: usize = 1 << 16;

    static mut PAGE_INFOS: [PageInfo; MAX_FRAMES] = [PageInfo::EMPTY; MAX_FRAMES];

    /// カーネル側から見える「物理メモリマネージャ」。
    /// - 外部 API はすべて safe にする。
    /// - 物理ページの中身には bootloader の physmap（phys_offset）経由で触る。
    pub struct PhysicalMemoryManager {
        frames: FrameTable<&'static mut [PageInfo]>,
        phys_offset: u64,
    }

    impl PhysicalMemoryManager {
        /// BootInfo から PhysicalMemoryManager を構築する。
        ///
        /// # 設計上の前提
        /// - カーネル全体で PhysicalMemoryManager は 1 インスタンスのみ保持すること。
        /// - 他のコードが memory_map の Usable フレームを直接触らないこと。
        pub fn new(boot_info: &'static BootInfo) -> Self {
            let memory_map: &'static MemoryMap = &boot_info.memory_map;

            // Safety: new() は起動時に一度だけ呼ばれる
            let infos: &'static mut [PageInfo] =
                unsafe { &mut *core::ptr::addr_of_mut!(PAGE_INFOS) };
            let mut frames = FrameTable::new(infos, 0);

            let mut added = 0u64;
            for frame in usable_frames(memory_map) {
                // frame 0 は null 物理アドレスと区別できないので使わない
                if frame.number == 0 {
                    continue;
                }
                if frames.add_free(frame) {
                    added += 1;
                }
            }
            crate::logging::info_u64("mm: usable frames", added);

            PhysicalMemoryManager {
                frames,
                phys_offset: boot_info.physical_memory_offset,
            }
        }

        pub fn phys_offset(&self) -> u64 {
            self.phys_offset
        }

        fn page_ptr(&self, frame: PhysFrame) -> *mut Page {
            (self.phys_offset + frame.start_address().0) as *mut Page
        }
    }

    /// memory_map 内の "Usable" な領域から、4KiB ごとの物理フレームを列挙する。
    fn usable_frames(memory_map: &'static MemoryMap) -> impl Iterator<Item = PhysFrame> {
        // 1. usable な領域だけを残す
        let usable_regions = memory_map
            .iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable);

        // 2. 各領域を [start_addr, end_addr) のアドレス範囲に変換
        let addr_ranges = usable_regions.map(|r| r.range.start_addr()..r.range.end_addr());

        // 3. 4KiB ごとのフレーム先頭アドレスに分解して PhysFrame にする
        addr_ranges
            .flat_map(|r| r.step_by(PAGE_SIZE as usize))
            .map(|addr| PhysAddr(addr).frame())
    }

    impl PhysMemory for PhysicalMemoryManager {
        fn alloc_page(&mut self) -> Option<PhysFrame> {
            let frame = self.frames.alloc()?;
            self.page_mut(frame).clear();
            Some(frame)
        }

        fn incref(&mut self, frame: PhysFrame) -> bool {
            self.frames.incref(frame)
        }

        fn decref(&mut self, frame: PhysFrame) {
            self.frames.decref(frame);
        }

        fn ref_count(&self, frame: PhysFrame) -> u16 {
            self.frames.ref_count(frame)
        }

        fn free_pages(&self) -> usize {
            self.frames.free_count()
        }

        fn page(&self, frame: PhysFrame) -> &Page {
            // Safety: physmap は全物理メモリを覆っている（bootloader の map_physical_memory）
            unsafe { &*self.page_ptr(frame) }
        }

        fn page_mut(&mut self, frame: PhysFrame) -> &mut Page {
            // Safety: 同上。&mut self がカーネルロック下の唯一のアクセス経路
            unsafe { &mut *self.page_ptr(frame) }
        }
    }
}
