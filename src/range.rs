//! 字节范围运算
//!
//! 所有函数都是纯函数：无状态、无 I/O、无失败路径。
//! 输入约定为有序、互不重叠的 RangeSet。

use serde::{Deserialize, Serialize};

/// 默认分片大小: 1MB
pub const DEFAULT_SLICE_SIZE: u64 = 1024 * 1024;

/// 闭区间字节范围 `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// 起始偏移（含）
    pub start: u64,
    /// 结束偏移（含）
    pub end: u64,
}

/// 有序、互不重叠的范围列表
pub type RangeSet = Vec<ByteRange>;

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "非法范围: {}-{}", start, end);
        Self { start, end }
    }

    /// 范围字节数
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// 是否完全包含另一个范围
    pub fn covers(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// 整个文件对应的范围集合，空文件返回空集合
pub fn full_range(total_size: u64) -> RangeSet {
    if total_size == 0 {
        Vec::new()
    } else {
        vec![ByteRange::new(0, total_size - 1)]
    }
}

/// 范围集合总字节数
pub fn sum_size(ranges: &[ByteRange]) -> u64 {
    ranges.iter().map(ByteRange::size).sum()
}

/// 根据剩余范围推算已完成字节数（用于恢复时初始化进度）
pub fn loaded_size(missing_ranges: &[ByteRange], total_size: u64) -> u64 {
    total_size.saturating_sub(sum_size(missing_ranges))
}

/// 分片的位置键，下载时按此索引定位字节
pub fn slice_index(range: &ByteRange, slice_size: u64) -> u64 {
    range.start / slice_size.max(1)
}

/// 把范围集合切成不超过 `slice_size` 的分片
///
/// 切分点对齐到 `slice_size` 的整数倍，同样的输入总是得到同样的分片边界，
/// 中途恢复的范围也不会改变 `start / slice_size` 的含义。
pub fn split_into_slices(ranges: &[ByteRange], slice_size: u64) -> RangeSet {
    let slice_size = slice_size.max(1);
    let mut slices = Vec::new();

    for range in ranges {
        let mut start = range.start;
        loop {
            // 下一个对齐边界前的最后一个字节
            let boundary_end = (start / slice_size)
                .checked_add(1)
                .and_then(|n| n.checked_mul(slice_size))
                .map(|b| b - 1)
                .unwrap_or(u64::MAX);
            let end = boundary_end.min(range.end);
            slices.push(ByteRange::new(start, end));

            if end >= range.end {
                break;
            }
            start = end + 1;
        }
    }

    slices
}

/// 从剩余范围中扣除一个已完成的范围
///
/// 四种情况：完全相同则移除；贴左边界则左侧收缩；贴右边界则右侧收缩；
/// 位于内部则一分为二。没有范围包含它时原样返回，重复扣除是安全的。
pub fn subtract_completed(missing_ranges: &[ByteRange], completed: ByteRange) -> RangeSet {
    let mut result = Vec::with_capacity(missing_ranges.len() + 1);
    let mut matched = false;

    for range in missing_ranges {
        if matched || !range.covers(&completed) {
            result.push(*range);
            continue;
        }
        matched = true;

        let touches_left = completed.start == range.start;
        let touches_right = completed.end == range.end;
        match (touches_left, touches_right) {
            (true, true) => {}
            (true, false) => result.push(ByteRange::new(completed.end + 1, range.end)),
            (false, true) => result.push(ByteRange::new(range.start, completed.start - 1)),
            (false, false) => {
                result.push(ByteRange::new(range.start, completed.start - 1));
                result.push(ByteRange::new(completed.end + 1, range.end));
            }
        }
    }

    result
}
