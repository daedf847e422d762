// src/mm/frame_table.rs
//
// 役割:
// - 物理フレームの参照カウントと free list を持つ。
// - 実機（BootInfo 由来の静的配列）と host シミュレータ（Vec）で同じロジックを使う。
//
// 不変条件:
// - free list 上のフレームは refs == 0
// - refs が 0 に落ちたフレームは即 free list に戻る
// - pool に登録されていないフレーム（kernel image 等）への incref/decref は無視する
// - refs は u16::MAX で頭打ち。それ以上の incref は拒否される

use crate::mem::addr::PhysFrame;

#[derive(Clone, Copy, Debug, Default)]
pub struct PageInfo {
    refs: u16,
    in_pool: bool,
    on_free_list: bool,
    next_free: Option<u32>,
}

impl PageInfo {
    pub const EMPTY: PageInfo = PageInfo {
        refs: 0,
        in_pool: false,
        on_free_list: false,
        next_free: None,
    };
}

pub struct FrameTable<S> {
    infos: S,
    /// infos[0] が表すフレーム番号
    base: u64,
    free_head: Option<u32>,
    free_count: usize,
}

impl<S> FrameTable<S>
where
    S: AsRef<[PageInfo]> + AsMut<[PageInfo]>,
{
    pub fn new(infos: S, base: u64) -> Self {
        FrameTable {
            infos,
            base,
            free_head: None,
            free_count: 0,
        }
    }

    fn slot(&self, frame: PhysFrame) -> Option<usize> {
        let idx = frame.number.checked_sub(self.base)? as usize;
        if idx < self.infos.as_ref().len() {
            Some(idx)
        } else {
            None
        }
    }

    /// 使用可能フレームとして pool に登録する（起動時のみ）
    pub fn add_free(&mut self, frame: PhysFrame) -> bool {
        let Some(idx) = self.slot(frame) else {
            return false;
        };
        if self.infos.as_ref()[idx].in_pool {
            return false;
        }
        self.infos.as_mut()[idx].in_pool = true;
        self.push_free(idx);
        true
    }

    fn push_free(&mut self, idx: usize) {
        let head = self.free_head;
        let info = &mut self.infos.as_mut()[idx];
        info.on_free_list = true;
        info.next_free = head;
        self.free_head = Some(idx as u32);
        self.free_count += 1;
    }

    /// free list の先頭を返す（refs は 0 のまま。マップ側が incref する）
    pub fn alloc(&mut self) -> Option<PhysFrame> {
        let idx = self.free_head? as usize;
        let info = &mut self.infos.as_mut()[idx];
        self.free_head = info.next_free.take();
        info.on_free_list = false;
        self.free_count -= 1;
        Some(PhysFrame::from_index(self.base + idx as u64))
    }

    /// 上限（u16::MAX）に達していたら増やさず false
    pub fn incref(&mut self, frame: PhysFrame) -> bool {
        let Some(idx) = self.slot(frame) else {
            return true;
        };
        let info = &mut self.infos.as_mut()[idx];
        if !info.in_pool {
            return true;
        }
        match info.refs.checked_add(1) {
            Some(n) => {
                info.refs = n;
                true
            }
            None => false,
        }
    }

    /// 0 になったら free list に戻す。戻したら true。
    pub fn decref(&mut self, frame: PhysFrame) -> bool {
        let Some(idx) = self.slot(frame) else {
            return false;
        };
        let info = &mut self.infos.as_mut()[idx];
        if !info.in_pool {
            return false;
        }
        if info.refs == 0 {
            // 確保直後で一度もマップされていないページの解放
            if info.on_free_list {
                panic!("frame_table: decref of free frame {:?}", frame);
            }
        } else {
            info.refs -= 1;
            if info.refs > 0 {
                return false;
            }
        }
        self.push_free(idx);
        true
    }

    pub fn ref_count(&self, frame: PhysFrame) -> u16 {
        self.slot(frame)
            .map(|idx| self.infos.as_ref()[idx].refs)
            .unwrap_or(0)
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn is_free(&self, frame: PhysFrame) -> bool {
        self.slot(frame)
            .map(|idx| self.infos.as_ref()[idx].on_free_list)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: u64) -> FrameTable<Vec<PageInfo>> {
        let mut t = FrameTable::new(vec![PageInfo::EMPTY; n as usize], 0x10);
        for i in (0..n).rev() {
            assert!(t.add_free(PhysFrame::from_index(0x10 + i)));
        }
        t
    }

    #[test]
    fn frames_come_back_when_the_last_reference_drops() {
        let mut t = table(4);
        let f = t.alloc().expect("frame");
        assert_eq!(f, PhysFrame::from_index(0x10));
        assert_eq!(t.free_count(), 3);

        t.incref(f);
        t.incref(f);
        assert!(!t.decref(f));
        assert!(!t.is_free(f));
        assert!(t.decref(f));
        assert!(t.is_free(f));
        assert_eq!(t.free_count(), 4);
    }

    #[test]
    fn never_mapped_frame_can_be_released_directly() {
        let mut t = table(2);
        let f = t.alloc().expect("frame");
        assert_eq!(t.ref_count(f), 0);
        assert!(t.decref(f));
        assert_eq!(t.free_count(), 2);
    }

    #[test]
    fn frames_outside_the_pool_are_ignored() {
        let mut t = table(2);
        let outside = PhysFrame::from_index(0x1);
        assert!(!t.add_free(PhysFrame::from_index(0x100)));
        t.incref(outside);
        assert!(!t.decref(outside));
        assert_eq!(t.ref_count(outside), 0);
        assert!(!t.add_free(PhysFrame::from_index(0x10)), "double registration");
    }

    #[test]
    #[should_panic(expected = "decref of free frame")]
    fn releasing_a_free_frame_is_a_bug() {
        let mut t = table(1);
        t.decref(PhysFrame::from_index(0x10));
    }

    #[test]
    fn incref_stops_at_the_counter_ceiling() {
        let mut t = table(1);
        let f = t.alloc().expect("frame");
        for _ in 0..u16::MAX {
            assert!(t.incref(f));
        }
        assert_eq!(t.ref_count(f), u16::MAX);

        assert!(!t.incref(f));
        assert_eq!(t.ref_count(f), u16::MAX);

        assert!(!t.decref(f));
        assert!(t.incref(f));
        assert_eq!(t.ref_count(f), u16::MAX);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut t = table(1);
        assert!(t.alloc().is_some());
        assert!(t.alloc().is_none());
    }
}
