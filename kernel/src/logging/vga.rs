// src/logging/vga.rs
//
// VGA テキスト画面（物理 0xb8000、physmap 経由）。
// - kernel ログは灰色、sys_cputs の出力は白で描く
// - user の出力は制御文字をそのまま流してくるので、\b と \t はここで解釈する
//
// 環境のアドレス空間には low half の恒等マップが無いので、物理アドレスでは触らない。

use core::fmt::{self, Write};
use spin::Mutex;
use volatile::Volatile;

const ROWS: usize = 25;
const COLS: usize = 80;
const VGA_PHYS: u64 = 0xb8000;
const TAB_WIDTH: usize = 4;

/// 前景色（背景は常に黒）
#[derive(Clone, Copy)]
pub enum Style {
    Kernel = 0x07,
    User = 0x0f,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Cell {
    ch: u8,
    attr: u8,
}

#[repr(transparent)]
struct Screen {
    cells: [[Volatile<Cell>; COLS]; ROWS],
}

/// 最下行に書き、改行で全体を 1 行上へ送る
struct Console {
    col: usize,
    attr: u8,
    screen: &'static mut Screen,
}

impl Console {
    fn put(&mut self, byte: u8) {
        match byte {
            b'\n' => self.scroll(),
            b'\r' => self.col = 0,
            b'\x08' => {
                if self.col > 0 {
                    self.col -= 1;
                    self.set(self.col, b' ');
                }
            }
            b'\t' => {
                let next = (self.col / TAB_WIDTH + 1) * TAB_WIDTH;
                while self.col < next && self.col < COLS {
                    self.put(b' ');
                }
            }
            byte => {
                if self.col >= COLS {
                    self.scroll();
                }
                let ch = if (0x20..0x7f).contains(&byte) { byte } else { 0xfe };
                self.set(self.col, ch);
                self.col += 1;
            }
        }
    }

    fn set(&mut self, col: usize, ch: u8) {
        self.screen.cells[ROWS - 1][col].write(Cell { ch, attr: self.attr });
    }

    fn scroll(&mut self) {
        for row in 1..ROWS {
            for col in 0..COLS {
                let c = self.screen.cells[row][col].read();
                self.screen.cells[row - 1][col].write(c);
            }
        }
        let blank = Cell {
            ch: b' ',
            attr: Style::Kernel as u8,
        };
        for col in 0..COLS {
            self.screen.cells[ROWS - 1][col].write(blank);
        }
        self.col = 0;
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.bytes().for_each(|b| self.put(b));
        Ok(())
    }
}

static CONSOLE: Mutex<Option<Console>> = Mutex::new(None);

pub fn init(phys_offset: u64) {
    // Safety: physmap は全物理メモリを覆う。VGA バッファはここ以外から触らない
    let screen = unsafe { &mut *((phys_offset + VGA_PHYS) as *mut Screen) };
    *CONSOLE.lock() = Some(Console {
        col: 0,
        attr: Style::Kernel as u8,
        screen,
    });
}

pub fn write_line(prefix: &str, args: fmt::Arguments<'_>) {
    if let Some(c) = CONSOLE.lock().as_mut() {
        c.attr = Style::Kernel as u8;
        let _ = c.write_str(prefix);
        let _ = c.write_fmt(args);
        c.put(b'\n');
    }
}

pub fn write_bytes(bytes: &[u8], style: Style) {
    if let Some(c) = CONSOLE.lock().as_mut() {
        c.attr = style as u8;
        bytes.iter().for_each(|&b| c.put(b));
    }
}
