// kernel/src/mem/address_space.rs
//
// 役割:
// - 1 つの環境のアドレス空間（4-level ページテーブルの root）を表現し、操作する。
// - walk / insert / lookup / remove と、環境解放時の user 領域一括解放。
//
// 設計方針:
// - テーブルの中身には PhysMemory::page() 経由（物理窓）で触る。CR3 には依存しない。
// - 中間テーブルは PRESENT|WRITABLE|USER で作り、権限は末端 PTE で絞る。
// - 参照カウント: マップ 1 つにつき incref 1。中間テーブルと root も自身を 1 で持つ。
//
// 不変条件:
// - UVPT スロット（PML4[255]）は root 自身を PRESENT|USER（read-only）で指す。
// - PML4[256..] は kernel root のコピー（共有。参照カウントしない）。

use crate::error::{Error, KResult};
use crate::kernel::hal::Hal;
use crate::mem::addr::{PhysAddr, PhysFrame, VirtAddr, ENTRY_COUNT};
use crate::mem::layout::UVPT_PML4_INDEX;
use crate::mem::paging::{PageFlags, Pte, TABLE_FLAGS};
use crate::mm::PhysMemory;

/// 末端 PTE の場所（どのテーブルページの何番目か）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSlot {
    pub table: PhysFrame,
    pub index: usize,
}

impl PteSlot {
    pub fn read<M: PhysMemory>(self, mem: &M) -> Pte {
        Pte(mem.page(self.table).entries()[self.index])
    }

    fn write<M: PhysMemory>(self, mem: &mut M, pte: Pte) {
        mem.page_mut(self.table).entries_mut()[self.index] = pte.0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysFrame,
}

impl AddressSpace {
    pub const fn from_root(root: PhysFrame) -> Self {
        AddressSpace { root }
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// 新しい環境用 root を作る。
    /// - kernel_root の PML4 エントリを丸ごとコピーし、UVPT 未満をゼロにする
    /// - UVPT スロットに自分自身を read-only で入れる
    pub fn new_user<M: PhysMemory>(mem: &mut M, kernel_root: PhysFrame) -> KResult<Self> {
        let root = mem.alloc_page().ok_or(Error::NoMem)?;
        mem.incref(root);

        let kernel_entries: [u64; ENTRY_COUNT] = *mem.page(kernel_root).entries();
        let table = mem.page_mut(root).entries_mut();
        for (i, e) in table.iter_mut().enumerate() {
            *e = if i < UVPT_PML4_INDEX { 0 } else { kernel_entries[i] };
        }
        table[UVPT_PML4_INDEX] = Pte::new(root, PageFlags::PRESENT | PageFlags::USER).0;

        Ok(AddressSpace { root })
    }

    /// va の末端 PTE を探す（テーブルは作らない）
    pub fn find<M: PhysMemory>(&self, mem: &M, va: VirtAddr) -> Option<PteSlot> {
        let mut table = self.root;
        for level in [4u8, 3, 2] {
            let pte = Pte(mem.page(table).entries()[va.table_index(level)]);
            if !pte.is_present() || pte.flags().contains(PageFlags::HUGE) {
                return None;
            }
            table = pte.frame();
        }
        Some(PteSlot {
            table,
            index: va.table_index(1),
        })
    }

    /// va の末端 PTE を探す。途中のテーブルが無ければ作る。
    pub fn walk_create<M: PhysMemory>(&self, mem: &mut M, va: VirtAddr) -> KResult<PteSlot> {
        let mut table = self.root;
        for level in [4u8, 3, 2] {
            let idx = va.table_index(level);
            let pte = Pte(mem.page(table).entries()[idx]);
            if pte.is_present() {
                if pte.flags().contains(PageFlags::HUGE) {
                    return Err(Error::Inval);
                }
                table = pte.frame();
                continue;
            }

            let next = mem.alloc_page().ok_or(Error::NoMem)?;
            mem.incref(next);
            mem.page_mut(table).entries_mut()[idx] = Pte::new(next, TABLE_FLAGS).0;
            table = next;
        }
        Ok(PteSlot {
            table,
            index: va.table_index(1),
        })
    }

    /// va にマップされているフレームと属性
    pub fn lookup<M: PhysMemory>(&self, mem: &M, va: VirtAddr) -> Option<(PhysFrame, PageFlags)> {
        let pte = self.find(mem, va)?.read(mem);
        if !pte.is_present() {
            return None;
        }
        Some((pte.frame(), pte.flags()))
    }

    pub fn translate<M: PhysMemory>(&self, mem: &M, va: VirtAddr) -> Option<PhysAddr> {
        let (frame, _) = self.lookup(mem, va)?;
        Some(PhysAddr(frame.start_address().0 + va.page_offset() as u64))
    }

    /// frame を va に perm でマップする。既存マップは置き換える。
    /// - 同じフレームの再マップでも参照カウントが崩れないよう、incref を先に行う。
    /// - 参照カウントが上限のフレームは NoMem（PTE は触らない）。
    pub fn insert<H: Hal>(&self, hal: &mut H, frame: PhysFrame, va: VirtAddr, perm: PageFlags) -> KResult<()> {
        let slot = self.walk_create(hal, va)?;

        if !hal.incref(frame) {
            return Err(Error::NoMem);
        }
        let old = slot.read(&*hal);
        if old.is_present() {
            slot.write(hal, Pte::EMPTY);
            hal.decref(old.frame());
            hal.invalidate_page(self.root, va.align_down());
        }

        slot.write(hal, Pte::new(frame, perm | PageFlags::PRESENT));
        hal.invalidate_page(self.root, va.align_down());
        Ok(())
    }

    /// va のマップを外す。マップが無ければ何もしない。
    pub fn remove<H: Hal>(&self, hal: &mut H, va: VirtAddr) {
        let Some(slot) = self.find(&*hal, va) else {
            return;
        };
        let old = slot.read(&*hal);
        if !old.is_present() {
            return;
        }
        slot.write(hal, Pte::EMPTY);
        hal.decref(old.frame());
        hal.invalidate_page(self.root, va.align_down());
    }

    /// user が va を perm で触れるか（全レベルで PRESENT|USER|perm）
    pub fn user_accessible<M: PhysMemory>(&self, mem: &M, va: VirtAddr, perm: PageFlags) -> bool {
        let need = perm | PageFlags::PRESENT | PageFlags::USER;
        let mut table = self.root;
        for level in [4u8, 3, 2, 1] {
            let pte = Pte(mem.page(table).entries()[va.table_index(level)]);
            if !pte.flags().contains(need) {
                return false;
            }
            if level > 1 && pte.flags().contains(PageFlags::HUGE) {
                return false;
            }
            table = pte.frame();
        }
        true
    }

    /// UVPT 未満の private マップとテーブルを全部解放し、最後に root を解放する。
    pub fn release<H: Hal>(self, hal: &mut H) {
        for l4 in 0..UVPT_PML4_INDEX {
            let e4 = Pte(hal.page(self.root).entries()[l4]);
            if !e4.is_present() {
                continue;
            }
            let pdpt = e4.frame();

            for l3 in 0..ENTRY_COUNT {
                let e3 = Pte(hal.page(pdpt).entries()[l3]);
                if !e3.is_present() {
                    continue;
                }
                let pd = e3.frame();

                for l2 in 0..ENTRY_COUNT {
                    let e2 = Pte(hal.page(pd).entries()[l2]);
                    if !e2.is_present() {
                        continue;
                    }
                    let pt = e2.frame();

                    for l1 in 0..ENTRY_COUNT {
                        let e1 = Pte(hal.page(pt).entries()[l1]);
                        if e1.is_present() {
                            let va = (l4 << 39) | (l3 << 30) | (l2 << 21) | (l1 << 12);
                            self.remove(hal, VirtAddr(va as u64));
                        }
                    }

                    hal.page_mut(pd).entries_mut()[l2] = 0;
                    hal.decref(pt);
                }

                hal.page_mut(pdpt).entries_mut()[l3] = 0;
                hal.decref(pd);
            }

            hal.page_mut(self.root).entries_mut()[l4] = 0;
            hal.decref(pdpt);
        }

        hal.decref(self.root);
    }
}
