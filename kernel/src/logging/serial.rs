// kernel/src/logging/serial.rs
//
// COM1 (0x3F8) への最小限のシリアル入出力。
// - init(): 115200bps, 8N1 に初期化
// - write_byte(): 1 バイト送信（送信可能になるまで待つ）
// - try_read_byte(): 受信データがあれば 1 バイト（sys_cgetc の入力源）

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

static SERIAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub fn init() {
    if SERIAL_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    // Safety: COM1 の標準 I/O ポート。起動時に一度だけ
    unsafe {
        let mut port_int_en = Port::<u8>::new(COM1 + 1);
        let mut port_line_ctrl = Port::<u8>::new(COM1 + 3);
        let mut port_div_low = Port::<u8>::new(COM1);
        let mut port_div_high = Port::<u8>::new(COM1 + 1);
        let mut port_fifo_ctrl = Port::<u8>::new(COM1 + 2);
        let mut port_modem_ctrl = Port::<u8>::new(COM1 + 4);

        port_int_en.write(0x00);

        port_line_ctrl.write(0x80);
        port_div_low.write(0x01);
        port_div_high.write(0x00);

        port_line_ctrl.write(0x03);
        port_fifo_ctrl.write(0xC7);
        port_modem_ctrl.write(0x0B);
    }
}

pub fn write_byte(byte: u8) {
    // Safety: COM1 の LSR / THR
    unsafe {
        let mut line_status = Port::<u8>::new(COM1 + 5);
        let mut data = Port::<u8>::new(COM1);

        while (line_status.read() & 0x20) == 0 {}

        data.write(byte);
    }
}

pub fn try_read_byte() -> Option<u8> {
    // Safety: COM1 の LSR / RBR
    unsafe {
        let mut line_status = Port::<u8>::new(COM1 + 5);
        if (line_status.read() & 0x01) == 0 {
            return None;
        }
        Some(Port::<u8>::new(COM1).read())
    }
}

pub struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            write_byte(b);
        }
        Ok(())
    }
}
