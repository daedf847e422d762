#![cfg(test)]
//! syscall 境界の性質テスト（proptest）
//!
//! - page_alloc が受け付ける perm は check_syscall_perm が認めるものとちょうど一致する
//! - page_map は読み取り専用ページを書き込み可能にして共有しない
//! - set_trapframe を通った frame は必ず user 特権で IOPL 0、割り込み許可
//! - 範囲外の syscall 番号は常に Inval

use proptest::prelude::*;

use super::{sanitize_user_trapframe, Syscall};
use crate::error::Error;
use crate::hosted::Machine;
use crate::mem::layout::ULIM;
use crate::mem::paging::{PageFlags, PTE_SYSCALL};
use crate::types::{sysno, EnvId, TrapFrame, FL_IF, FL_IOPL_MASK, GD_UD, GD_UT, RPL_USER};

const SCRATCH: u64 = 0x90_0000;

fn booted() -> (Machine, EnvId) {
    let mut buf = [0u8; crate::kernel::user_program::DEMO_IMAGE_MAX];
    let n = crate::kernel::user_program::build_demo_image(&mut buf).expect("demo image fits");
    let mut m = Machine::new(64, 2);
    let id = m.create(&buf[..n]).expect("env_create");
    assert_eq!(m.schedule(), Some(id));
    (m, id)
}

fn arb_perm() -> impl Strategy<Value = u64> {
    prop_oneof![
        0u64..0x400,
        (0u64..0x400).prop_map(|low| low | (1 << 63)),
        any::<u64>(),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn page_alloc_accepts_exactly_the_syscall_perms(perm in arb_perm()) {
        let (mut m, id) = booted();
        let r = m.syscall(sysno::PAGE_ALLOC, [0, SCRATCH, perm, 0, 0]).ret();

        let need = (PageFlags::PRESENT | PageFlags::USER).bits();
        let allowed = perm & !PTE_SYSCALL.bits() == 0 && perm & need == need;
        if allowed {
            prop_assert_eq!(r, 0);
            prop_assert!(m.kernel.translate(id, SCRATCH).is_some());
        } else {
            prop_assert_eq!(r, Error::Inval.code() as i64);
            prop_assert!(m.kernel.translate(id, SCRATCH).is_none());
        }
    }

    #[test]
    fn page_map_never_upgrades_a_read_only_source(extra in 0u64..0x400) {
        let (mut m, id) = booted();
        let ro = (PageFlags::PRESENT | PageFlags::USER).bits();
        prop_assert_eq!(m.syscall(sysno::PAGE_ALLOC, [0, SCRATCH, ro, 0, 0]).ret(), 0);

        let dst = SCRATCH + 0x1000;
        let r = m.syscall(sysno::PAGE_MAP, [0, SCRATCH, 0, dst, ro | extra]).ret();
        if r == 0 {
            let space = m.kernel.env(id).and_then(|e| e.space).expect("space");
            let (_, flags) = space.lookup(m.hal(), crate::mem::addr::VirtAddr(dst)).expect("mapped");
            prop_assert!(!flags.contains(PageFlags::WRITABLE));
        } else {
            prop_assert_eq!(r, Error::Inval.code() as i64);
        }
    }

    #[test]
    fn sanitized_frames_run_unprivileged(
        rip in any::<u64>(),
        rsp in any::<u64>(),
        rflags in any::<u64>(),
        cs in any::<u16>(),
        ss in any::<u16>(),
    ) {
        let tf = TrapFrame {
            rip,
            rsp,
            rflags,
            cs: cs as u64,
            ss: ss as u64,
            ..TrapFrame::zeroed()
        };
        match sanitize_user_trapframe(tf) {
            Ok(out) => {
                prop_assert!(rip < ULIM && rsp < ULIM);
                prop_assert_eq!(out.cs, (GD_UT | RPL_USER) as u64);
                prop_assert_eq!(out.ss, (GD_UD | RPL_USER) as u64);
                prop_assert_eq!(out.rflags & FL_IOPL_MASK, 0);
                prop_assert_ne!(out.rflags & FL_IF, 0);
                prop_assert_eq!((out.rip, out.rsp), (rip, rsp));
            }
            Err(e) => {
                prop_assert_eq!(e, Error::Inval);
                prop_assert!(rip >= ULIM || rsp >= ULIM);
            }
        }
    }

    #[test]
    fn numbers_past_ipc_recv_are_invalid(no in (sysno::IPC_RECV + 1)..u64::MAX, a in any::<[u64; 5]>()) {
        prop_assert_eq!(Syscall::decode(no, a), Err(Error::Inval));
    }

    #[test]
    fn decode_accepts_sign_extended_handles(id in any::<i32>()) {
        let call = Syscall::decode(sysno::ENV_DESTROY, [id as i64 as u64, 0, 0, 0, 0]);
        prop_assert_eq!(call, Ok(Syscall::EnvDestroy { env: EnvId(id) }));
    }

    #[test]
    fn decode_rejects_handles_with_stray_upper_bits(low in any::<u32>(), high in 1u32..u32::MAX) {
        let raw = ((high as u64) << 32) | low as u64;
        prop_assume!(EnvId::from_reg(raw).is_none());
        let call = Syscall::decode(sysno::PAGE_UNMAP, [raw, 0, 0, 0, 0]);
        prop_assert_eq!(call, Err(Error::BadEnv));
    }
}
