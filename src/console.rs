//! 早期控制台
//!
//! 启动阶段还没有任何字符设备，所有输出先写进一个有界的内存缓冲区，
//! 等真正的控制台驱动起来之后再由它取走（`dmesg` 也从这里读）。

use alloc::string::String;
use core::fmt::{self, Write};
use spin::Mutex;

/// 缓冲区上限，超出后丢弃最旧的内容
const CONSOLE_CAPACITY: usize = 64 * 1024;

struct EarlyConsole {
    buf: String,
}

impl Write for EarlyConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.push_str(s);
        if self.buf.len() > CONSOLE_CAPACITY {
            let mut cut = self.buf.len() - CONSOLE_CAPACITY;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
        Ok(())
    }
}

static CONSOLE: Mutex<EarlyConsole> = Mutex::new(EarlyConsole { buf: String::new() });

pub fn print(args: fmt::Arguments) {
    // EarlyConsole::write_str 不会失败
    let _ = CONSOLE.lock().write_fmt(args);
}

/// 取走并清空控制台中缓存的全部输出
pub fn drain() -> String {
    core::mem::take(&mut CONSOLE.lock().buf)
}

/// 当前缓存内容的拷贝
pub fn contents() -> String {
    CONSOLE.lock().buf.clone()
}

#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?))
    }
}

#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    }
}
