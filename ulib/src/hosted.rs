// ulib/src/hosted.rs
//
// host 上の Context: exo_kernel::hosted::Machine の中の 1 環境として振る舞う。
//
// - 操作のたびに、自分がこの CPU の current でなければ走らせてから行う
//   （scheduler がいずれ自分に戻ってくるのと同じ）
// - load/store が upcall になったら、trampoline と同じく dispatch → 復帰 → 再試行する

use exo_kernel::hosted::{Fault, Machine};
use exo_kernel::mem::addr::PAGE_SIZE;
use exo_kernel::types::{EnvId, EnvStatus, SyscallRegs};

use crate::pgfault::{self, PgfaultHandler};
use crate::Context;

/// trampoline の代わりに渡す upcall 入口（kernel は値を保存するだけ）
pub const SIM_UPCALL_ENTRY: u64 = 0x0080_0ff0;

pub struct SimEnv<'m> {
    m: &'m mut Machine,
    me: EnvId,
    handler: Option<PgfaultHandler>,
    thisenv: Option<EnvId>,
    /// puts() の出力
    pub messages: Vec<String>,
}

impl<'m> SimEnv<'m> {
    /// handler は fork の子のように「メモリごと受け継いだ」ものを渡す
    pub fn attach(m: &'m mut Machine, me: EnvId, handler: Option<PgfaultHandler>) -> Self {
        SimEnv {
            m,
            me,
            handler,
            thisenv: None,
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> EnvId {
        self.me
    }

    pub fn machine(&self) -> &Machine {
        &*self.m
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut *self.m
    }

    pub fn is_alive(&self) -> bool {
        self.m.is_alive(self.me)
    }

    fn enter(&mut self) {
        if self.m.current() == Some(self.me) {
            return;
        }
        match self.m.status(self.me) {
            Some(EnvStatus::Runnable) => {
                if let Err(e) = self.m.run(self.me) {
                    panic!("env {} cannot run: {}", self.me, e);
                }
            }
            other => panic!("env {} is not runnable ({:?})", self.me, other),
        }
    }

    /// upcall に入った状態から handler を走らせ、fault 時点へ戻る
    fn upcall(&mut self) -> Result<(), Fault> {
        let utf = self.m.read_utrapframe()?;
        pgfault::dispatch(self, &utf);
        if !self.is_alive() {
            return Err(Fault::Killed);
        }
        self.enter();
        self.m.resume_from_upcall(&utf);
        Ok(())
    }

    pub fn load(&mut self, va: u64, buf: &mut [u8]) -> Result<(), Fault> {
        loop {
            self.enter();
            match self.m.load(va, buf) {
                Ok(()) => return Ok(()),
                Err(Fault::Upcall { .. }) => self.upcall()?,
                Err(Fault::Killed) => return Err(Fault::Killed),
            }
        }
    }

    pub fn store(&mut self, va: u64, data: &[u8]) -> Result<(), Fault> {
        loop {
            self.enter();
            match self.m.store(va, data) {
                Ok(()) => return Ok(()),
                Err(Fault::Upcall { .. }) => self.upcall()?,
                Err(Fault::Killed) => return Err(Fault::Killed),
            }
        }
    }

    pub fn read_u64(&mut self, va: u64) -> Result<u64, Fault> {
        let mut b = [0u8; 8];
        self.load(va, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u64(&mut self, va: u64, value: u64) -> Result<(), Fault> {
        self.store(va, &value.to_le_bytes())
    }
}

impl Context for SimEnv<'_> {
    fn syscall(&mut self, no: u64, args: [u64; 5]) -> SyscallRegs {
        self.enter();
        self.m.syscall(no, args)
    }

    fn read_word(&mut self, va: u64) -> u64 {
        match self.read_u64(va) {
            Ok(v) => v,
            Err(f) => panic!("env {} died reading {:#x}: {:?}", self.me, va, f),
        }
    }

    fn copy_page(&mut self, dst: u64, src: u64) {
        let mut page = vec![0u8; PAGE_SIZE as usize];
        if let Err(f) = self.load(src, &mut page).and_then(|()| self.store(dst, &page)) {
            panic!("env {} died copying {:#x} -> {:#x}: {:?}", self.me, src, dst, f);
        }
    }

    fn puts(&mut self, msg: &str) {
        self.messages.push(msg.to_string());
    }

    fn upcall_entry(&self) -> u64 {
        SIM_UPCALL_ENTRY
    }

    fn handler(&self) -> Option<PgfaultHandler> {
        self.handler
    }

    fn set_handler(&mut self, handler: PgfaultHandler) {
        self.handler = Some(handler);
    }

    fn thisenv(&self) -> Option<EnvId> {
        self.thisenv
    }

    fn set_thisenv(&mut self, id: EnvId) {
        self.thisenv = Some(id);
    }
}
