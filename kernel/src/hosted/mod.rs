// kernel/src/hosted/mod.rs
//
// host 上で Kernel コアを動かすためのシミュレータ。
//
// 役割:
// - SimHal: Vec 上の物理ページ + FrameTable で PhysMemory を、記録するだけの Platform を実装する
// - Machine: 1 CPU の「user モード実行」を模す（レジスタ、MMU 経由の load/store、int 0x30）
//
// やらないこと:
// - 命令の実行（user コードは Rust のクロージャ / テストが代わりに動く）
//
// 設計方針:
// - Kernel 側から見えるのは実機と同じ Hal だけ。テストのための分岐を Kernel に入れない。

mod machine;

pub use machine::{Fault, Machine};

use std::collections::VecDeque;

use crate::kernel::{CpuId, Platform};
use crate::mem::addr::{PhysFrame, VirtAddr};
use crate::mm::{FrameTable, Page, PageInfo, PhysMemory};
use crate::types::{TrapFrame, NCPU};

/// 0 番付近を null と区別するため、プールはこのフレーム番号から始める
pub const BASE_FRAME: u64 = 0x100;

pub struct SimHal {
    pages: Vec<Box<Page>>,
    frames: FrameTable<Vec<PageInfo>>,
    cr3: [Option<PhysFrame>; NCPU],

    /// 次の fault_address() が返す値（Machine が #PF を起こす前に書く）
    pub fault_va: u64,
    pub console: Vec<u8>,
    pub input: VecDeque<u8>,
    pub eois: Vec<u8>,
    pub monitor_calls: usize,
    pub tlb_flushes: usize,
}

impl SimHal {
    pub fn new(npages: usize) -> Self {
        let mut pages = Vec::with_capacity(npages);
        for _ in 0..npages {
            pages.push(Box::new(Page::zeroed()));
        }

        let mut frames = FrameTable::new(vec![PageInfo::EMPTY; npages], BASE_FRAME);
        // 低い番号から払い出されるよう逆順に積む
        for i in (0..npages as u64).rev() {
            frames.add_free(PhysFrame::from_index(BASE_FRAME + i));
        }

        SimHal {
            pages,
            frames,
            cr3: [None; NCPU],
            fault_va: 0,
            console: Vec::new(),
            input: VecDeque::new(),
            eois: Vec::new(),
            monitor_calls: 0,
            tlb_flushes: 0,
        }
    }

    /// kernel root を作る。上半分に共有テーブルを 1 つ置き、kernel が永久に 1 参照持つ。
    pub fn make_kernel_root(&mut self) -> Option<PhysFrame> {
        use crate::mem::layout::KERNEL_PML4_START;
        use crate::mem::paging::{PageFlags, Pte};

        let root = self.alloc_page()?;
        self.incref(root);
        let shared = self.alloc_page()?;
        self.incref(shared);

        self.page_mut(root).entries_mut()[KERNEL_PML4_START] =
            Pte::new(shared, PageFlags::PRESENT | PageFlags::WRITABLE).0;
        Some(root)
    }

    pub fn loaded_root(&self, cpu: CpuId) -> Option<PhysFrame> {
        self.cr3[cpu.index()]
    }

    pub fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.console).into_owned()
    }

    pub fn is_free(&self, frame: PhysFrame) -> bool {
        self.frames.is_free(frame)
    }

    fn slot(&self, frame: PhysFrame) -> usize {
        match frame.number.checked_sub(BASE_FRAME) {
            Some(i) if (i as usize) < self.pages.len() => i as usize,
            _ => panic!("SimHal: frame {:?} outside the simulated pool", frame),
        }
    }
}

impl PhysMemory for SimHal {
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
        &self.pages[self.slot(frame)]
    }

    fn page_mut(&mut self, frame: PhysFrame) -> &mut Page {
        let i = self.slot(frame);
        &mut self.pages[i]
    }
}

impl Platform for SimHal {
    fn load_root(&mut self, cpu: CpuId, root: PhysFrame) {
        self.cr3[cpu.index()] = Some(root);
    }

    fn invalidate_page(&mut self, root: PhysFrame, _va: VirtAddr) {
        if self.cr3.contains(&Some(root)) {
            self.tlb_flushes += 1;
        }
    }

    fn fault_address(&self) -> u64 {
        self.fault_va
    }

    fn console_write(&mut self, bytes: &[u8]) {
        self.console.extend_from_slice(bytes);
    }

    fn console_getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        self.eois.push(irq);
    }

    fn monitor(&mut self, _tf: &TrapFrame) {
        self.monitor_calls += 1;
    }
}
