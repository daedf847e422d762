// kernel/src/kernel/loader.rs
//
// 役割:
// - ELF64 イメージを環境のアドレス空間へロードし、初期スタックを 1 ページ用意する。
//
// 設計方針:
// - 先に全 PT_LOAD を検査してから書き始める（途中で Inval になって半端に残らないように）
// - 書き込みは物理窓経由（CR3 は切り替えない）
// - magic が無いイメージは何もせず成功扱い（entry は 0 のまま）

use crate::error::{Error, KResult};
use crate::logging;
use crate::mem::addr::PAGE_SIZE;
use crate::mem::layout::{USTACKTOP, UTOP};

use super::elf::ElfFile;
use super::hal::Hal;
use super::Kernel;

impl<H: Hal> Kernel<H> {
    pub fn load_image(&mut self, idx: usize, image: &[u8]) -> KResult<()> {
        let Some(elf) = ElfFile::parse(image) else {
            logging::error("load_image: not an ELF image; nothing loaded");
            return Ok(());
        };

        for seg in elf.load_segments() {
            let ph = seg.map_err(|_| Error::Inval)?;
            if ph.p_filesz > ph.p_memsz {
                return Err(Error::Inval);
            }
            if elf.segment_data(&ph).is_none() {
                return Err(Error::Inval);
            }
            match ph.p_vaddr.checked_add(ph.p_memsz) {
                Some(end) if end <= UTOP => {}
                _ => return Err(Error::Inval),
            }
        }

        for seg in elf.load_segments() {
            let ph = seg.map_err(|_| Error::Inval)?;
            let data = elf.segment_data(&ph).ok_or(Error::Inval)?;

            self.region_alloc(idx, ph.p_vaddr, ph.p_memsz)?;
            self.copy_to_user(idx, ph.p_vaddr, data)?;
            self.zero_user(idx, ph.p_vaddr + ph.p_filesz, ph.p_memsz - ph.p_filesz)?;
        }

        self.envs.get_mut(idx).tf.rip = elf.entry();

        self.region_alloc(idx, USTACKTOP - PAGE_SIZE, PAGE_SIZE)?;
        Ok(())
    }
}
