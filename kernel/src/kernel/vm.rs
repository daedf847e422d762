// kernel/src/kernel/vm.rs
//
// 役割:
// - 環境のアドレス空間を作り、user 領域にページを用意し、user メモリを検査・コピーする。
//
// やること:
// - env_setup_vm: kernel 半分のコピー + UVPT 自己マップ付きの root を作る
// - region_alloc: [va, va+len) をページ単位で覆う
// - user_mem_check: syscall 引数として渡された user 範囲の検査
// - copy_to_user / copy_from_user: 物理窓経由のコピー（CR3 は切り替えない）
//
// やらないこと:
// - 権限の判断（呼び出し側が perm を決める）

use crate::error::{Error, KResult};
use crate::logging;
use crate::mem::addr::{round_down, round_up, VirtAddr, PAGE_SIZE};
use crate::mem::address_space::AddressSpace;
use crate::mem::layout::{ULIM, UTOP};
use crate::mem::paging::PageFlags;

use super::hal::Hal;
use super::Kernel;

impl<H: Hal> Kernel<H> {
    fn space_of(&self, idx: usize) -> KResult<AddressSpace> {
        self.envs.get(idx).space.ok_or(Error::BadEnv)
    }

    /// envs[idx] に新しいアドレス空間を付ける。失敗したら何も変えない。
    pub fn env_setup_vm(&mut self, idx: usize) -> KResult<()> {
        let space = AddressSpace::new_user(&mut self.hal, self.kern_root)?;
        self.envs.get_mut(idx).space = Some(space);
        Ok(())
    }

    /// [va, va+len) を覆うページを user|writable で確保してマップする。
    /// - 既にマップ済みのページはそのまま使う。
    pub fn region_alloc(&mut self, idx: usize, va: u64, len: u64) -> KResult<()> {
        let space = self.space_of(idx)?;
        let start = round_down(va);
        let end = va
            .checked_add(len)
            .and_then(round_up)
            .ok_or(Error::Inval)?;
        if end > UTOP {
            return Err(Error::Inval);
        }

        let mut page = start;
        while page < end {
            if space.lookup(&self.hal, VirtAddr(page)).is_none() {
                let frame = self.hal.alloc_page().ok_or(Error::NoMem)?;
                if let Err(e) = space.insert(
                    &mut self.hal,
                    frame,
                    VirtAddr(page),
                    PageFlags::USER | PageFlags::WRITABLE,
                ) {
                    self.hal.decref(frame);
                    return Err(e);
                }
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// user が [va, va+len) を perm で触れるか。
    /// ダメなら最初に引っかかったアドレスを返す。
    pub fn user_mem_check(&self, idx: usize, va: u64, len: u64, perm: PageFlags) -> Result<(), u64> {
        let Ok(space) = self.space_of(idx) else {
            return Err(va);
        };
        let Some(end) = va.checked_add(len) else {
            return Err(va);
        };

        let mut page = round_down(va);
        while page < end {
            let first = page.max(va);
            if first >= ULIM || !space.user_accessible(&self.hal, VirtAddr(page), perm) {
                return Err(first);
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// user_mem_check の失敗をログに残して Inval にする
    pub(crate) fn user_mem_assert(&self, idx: usize, va: u64, len: u64, perm: PageFlags) -> KResult<()> {
        self.user_mem_check(idx, va, len, perm).map_err(|bad| {
            logging::info_fmt(format_args!(
                "[{}] user_mem_check assertion failure for va {:08x}",
                self.envs.get(idx).id,
                bad
            ));
            Error::Inval
        })
    }

    /// kernel から環境の va へ書く。マップされていないページがあれば Inval。
    pub fn copy_to_user(&mut self, idx: usize, va: u64, data: &[u8]) -> KResult<()> {
        let space = self.space_of(idx)?;
        let mut done = 0usize;
        while done < data.len() {
            let cur = VirtAddr(va + done as u64);
            let (frame, _) = space.lookup(&self.hal, cur).ok_or(Error::Inval)?;
            let off = cur.page_offset();
            let n = (PAGE_SIZE as usize - off).min(data.len() - done);
            self.hal.page_mut(frame).bytes[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// 環境の va から kernel のバッファへ読む
    pub fn copy_from_user(&self, idx: usize, va: u64, buf: &mut [u8]) -> KResult<()> {
        let space = self.space_of(idx)?;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = VirtAddr(va + done as u64);
            let (frame, _) = space.lookup(&self.hal, cur).ok_or(Error::Inval)?;
            let off = cur.page_offset();
            let n = (PAGE_SIZE as usize - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&self.hal.page(frame).bytes[off..off + n]);
            done += n;
        }
        Ok(())
    }

    /// 環境の va から len バイトを 0 で埋める
    pub(crate) fn zero_user(&mut self, idx: usize, va: u64, len: u64) -> KResult<()> {
        const ZEROS: [u8; 256] = [0; 256];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(ZEROS.len() as u64);
            self.copy_to_user(idx, va + done, &ZEROS[..n as usize])?;
            done += n;
        }
        Ok(())
    }
}
