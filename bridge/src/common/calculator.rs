use std::{
    collections::{BTreeSet, HashMap},
    ops::Range,
};

/// 对齐的空闲区间表，按 (长度, 起点) 排序以支持最佳适配。
///
/// 相邻的空闲区间在回收时合并。
#[derive(Debug)]
pub struct FreeList {
    alignment: usize,
    /// (len, off)
    free: BTreeSet<(usize, usize)>,
    heads: HashMap<usize, usize>,
    tails: HashMap<usize, usize>,
    available: usize,
}

impl FreeList {
    /// 创建管理 `area` 的空闲表，`area` 起点需满足对齐。
    pub fn new(area: Range<usize>, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        assert_eq!(area.start % alignment, 0);
        let mut ans = Self {
            alignment,
            free: BTreeSet::new(),
            heads: HashMap::new(),
            tails: HashMap::new(),
            available: 0,
        };
        let len = area.len() / alignment * alignment;
        if len > 0 {
            ans.insert(area.start, len);
            ans.available = len;
        }
        ans
    }

    #[inline]
    pub const fn available(&self) -> usize {
        self.available
    }

    #[inline]
    fn align(&self, len: usize) -> usize {
        len.div_ceil(self.alignment) * self.alignment
    }

    /// 取出一段长度不小于 `expect` 的区间。`expect` 为 0 时不分配。
    pub fn take(&mut self, expect: usize) -> Option<Range<usize>> {
        let len = self.align(expect);
        if len == 0 {
            return None;
        }

        let &(free_len, off) = self.free.range((len, 0)..).next()?;
        self.remove(off, free_len);
        if free_len > len {
            self.insert(off + len, free_len - len)
        }
        self.available -= len;
        Some(off..off + expect)
    }

    /// 归还 `take` 得到的区间。
    pub fn put(&mut self, range: Range<usize>) {
        let len = self.align(range.len());
        if len == 0 {
            return;
        }
        self.available += len;

        let mut head = range.start;
        let mut tail = head + len;
        if let Some(prev) = self.tails.get(&head).copied() {
            head -= prev;
            self.remove(head, prev);
        }
        if let Some(next) = self.heads.get(&tail).copied() {
            self.remove(tail, next);
            tail += next;
        }
        self.insert(head, tail - head)
    }

    fn insert(&mut self, off: usize, len: usize) {
        self.free.insert((len, off));
        self.heads.insert(off, len);
        self.tails.insert(off + len, len);
    }

    fn remove(&mut self, off: usize, len: usize) {
        assert!(self.free.remove(&(len, off)));
        assert_eq!(self.heads.remove(&off), Some(len));
        assert_eq!(self.tails.remove(&(off + len)), Some(len));
    }
}
