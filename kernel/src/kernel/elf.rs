// kernel/src/kernel/elf.rs
//
// ELF64 の最小限の読み書き。
// - 読み: ヘッダと PT_LOAD セグメントを取り出す（境界チェック付き、アラインを仮定しない）
// - 書き: 組み込みデモや テスト用に、PT_LOAD だけのイメージをバッファに組み立てる

use core::mem::size_of;

pub const EI_NIDENT: usize = 16;
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1 << 0;
pub const PF_W: u32 = 1 << 1;
pub const PF_R: u32 = 1 << 2;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; EI_NIDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

pub const EHDR_SIZE: usize = size_of::<Elf64Ehdr>();
pub const PHDR_SIZE: usize = size_of::<Elf64Phdr>();

static_assertions::const_assert_eq!(EHDR_SIZE, 64);
static_assertions::const_assert_eq!(PHDR_SIZE, 56);

fn read_at<T: Copy>(bytes: &[u8], off: usize) -> Option<T> {
    let end = off.checked_add(size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }
    // Safety: 範囲は確認済み。T は整数だけからなる repr(C)
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().add(off) as *const T) })
}

fn write_at<T: Copy>(buf: &mut [u8], off: usize, v: &T) -> Option<()> {
    let end = off.checked_add(size_of::<T>())?;
    let dst = buf.get_mut(off..end)?;
    // Safety: 同上
    let src = unsafe { core::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) };
    dst.copy_from_slice(src);
    Some(())
}

/// 解析済みイメージ
pub struct ElfFile<'a> {
    bytes: &'a [u8],
    ehdr: Elf64Ehdr,
}

impl<'a> ElfFile<'a> {
    /// magic が合わなければ None
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let ehdr: Elf64Ehdr = read_at(bytes, 0)?;
        if ehdr.e_ident[..4] != ELF_MAGIC {
            return None;
        }
        Some(ElfFile { bytes, ehdr })
    }

    pub fn entry(&self) -> u64 {
        self.ehdr.e_entry
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// i 番目のプログラムヘッダ。テーブルがイメージからはみ出していれば None。
    pub fn program_header(&self, i: usize) -> Option<Elf64Phdr> {
        if i >= self.ehdr.e_phnum as usize {
            return None;
        }
        let stride = match self.ehdr.e_phentsize as usize {
            0 => PHDR_SIZE,
            n => n,
        };
        let off = (self.ehdr.e_phoff as usize).checked_add(i.checked_mul(stride)?)?;
        read_at(self.bytes, off)
    }

    pub fn phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    /// PT_LOAD だけを順に返す。読めないヘッダは Err。
    pub fn load_segments(&self) -> impl Iterator<Item = Result<Elf64Phdr, usize>> + '_ {
        (0..self.phnum()).filter_map(move |i| match self.program_header(i) {
            Some(ph) if ph.p_type == PT_LOAD => Some(Ok(ph)),
            Some(_) => None,
            None => Some(Err(i)),
        })
    }

    /// セグメントのファイル内データ（範囲外なら None）
    pub fn segment_data(&self, ph: &Elf64Phdr) -> Option<&'a [u8]> {
        let start = usize::try_from(ph.p_offset).ok()?;
        let len = usize::try_from(ph.p_filesz).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

/// 書き出し用のセグメント記述
pub struct SegmentSpec<'a> {
    pub vaddr: u64,
    pub data: &'a [u8],
    pub memsz: u64,
    pub flags: u32,
}

/// PT_LOAD だけの ELF64 を buf に書く。書いたバイト数を返す（入りきらなければ None）。
pub fn write_image(buf: &mut [u8], entry: u64, segments: &[SegmentSpec<'_>]) -> Option<usize> {
    let phoff = EHDR_SIZE;
    let mut data_off = phoff + segments.len() * PHDR_SIZE;

    let mut e_ident = [0u8; EI_NIDENT];
    e_ident[..4].copy_from_slice(&ELF_MAGIC);
    e_ident[4] = ELFCLASS64;
    e_ident[5] = ELFDATA2LSB;
    e_ident[6] = 1;

    let ehdr = Elf64Ehdr {
        e_ident,
        e_type: ET_EXEC,
        e_machine: EM_X86_64,
        e_version: 1,
        e_entry: entry,
        e_phoff: phoff as u64,
        e_ehsize: EHDR_SIZE as u16,
        e_phentsize: PHDR_SIZE as u16,
        e_phnum: segments.len() as u16,
        ..Elf64Ehdr::default()
    };
    write_at(buf, 0, &ehdr)?;

    for (i, seg) in segments.iter().enumerate() {
        let ph = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: seg.flags,
            p_offset: data_off as u64,
            p_vaddr: seg.vaddr,
            p_paddr: seg.vaddr,
            p_filesz: seg.data.len() as u64,
            p_memsz: seg.memsz,
            p_align: 0x1000,
        };
        write_at(buf, phoff + i * PHDR_SIZE, &ph)?;

        let end = data_off.checked_add(seg.data.len())?;
        buf.get_mut(data_off..end)?.copy_from_slice(seg.data);
        data_off = end;
    }
    Some(data_off)
}
