use bytes::{Bytes, BytesMut};

/// `DBuffer` 的后备存储形态。
///
/// 不变量：任一时刻恰好处于一种形态；`Chain` 中不存放空分段。
#[derive(Debug)]
enum Backing {
    /// 自有连续向量。空缓冲以 `Owned(Vec::new())` 表示。
    Owned(Vec<u8>),
    /// 从网络栈缓冲捐赠而来的分段链，段内存由引用计数持有。
    Chain(Vec<Bytes>),
}

/// 非连续字节缓冲：由单个自有向量、或一串捐赠分段构成的字节容器。
///
/// # 设计初衷（Why）
/// - 收包路径希望把网络栈已经持有的报文体整段移交给 Block 缓存，
///   避免在高速率下为每一帧做整体 memcpy；
/// - 发包与记录层访问则需要按偏移、跨步读写字段。两类诉求共用同一容器，
///   消费侧不得假设内容连续。
///
/// # 契约定义（What）
/// - `size()` 恒等于全部分段长度之和；`nstrides()` 报告分段数量；
/// - `resize`/`assign`/`copyin` 之后缓冲必为自有向量形态；
/// - `consume` 之后缓冲为分段链形态（零拷贝接管输入字节）；
/// - `copyout_shape(dst, off, esize, iskip, dskip, ec)` 产出最大的
///   `k ≤ ec`，满足 `off + esize*k + iskip*(k-1) ≤ size()`，
///   且第 `i` 个元素等价于 `copyout(off + i*(esize+iskip), esize)`。
///
/// # 实现说明（How）
/// - 读取以"分段游标"推进：每步复制 `min(段内剩余, 还需字节)`，
///   跨段元素由游标自然拼接，复制不会越过段边界；
/// - 需要可变访问（`copyin`）而当前为分段链时，先整体落为自有向量再写入，
///   语义与直接写入一致，只是放弃了该次的零拷贝形态。
#[derive(Debug, Default)]
pub struct DBuffer {
    backing: Backing,
}

impl Default for Backing {
    fn default() -> Self {
        Backing::Owned(Vec::new())
    }
}

impl DBuffer {
    /// 构造空缓冲。
    pub fn new() -> Self {
        Self::default()
    }

    /// 构造长度为 `n` 的零填充自有缓冲。
    pub fn zeroed(n: usize) -> Self {
        DBuffer {
            backing: Backing::Owned(vec![0; n]),
        }
    }

    /// 从既有分段构造缓冲；空分段被丢弃。
    pub fn from_segments<I>(segments: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let chain: Vec<Bytes> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        if chain.is_empty() {
            Self::new()
        } else {
            DBuffer {
                backing: Backing::Chain(chain),
            }
        }
    }

    /// 当前字节总数（各分段长度之和）。
    pub fn size(&self) -> usize {
        match &self.backing {
            Backing::Owned(v) => v.len(),
            Backing::Chain(c) => c.iter().map(Bytes::len).sum(),
        }
    }

    /// 当前分段数量。自有形态在非空时计为一个分段。
    pub fn nstrides(&self) -> usize {
        match &self.backing {
            Backing::Owned(v) => usize::from(!v.is_empty()),
            Backing::Chain(c) => c.len(),
        }
    }

    /// 释放全部后备存储并回到空的自有形态。
    pub fn clear(&mut self) {
        self.backing = Backing::Owned(Vec::new());
    }

    /// 调整长度为 `n`。
    ///
    /// 分段链形态会先整体拷出为单个自有向量再调整；自有形态原地
    /// `resize`，增长部分补零。
    pub fn resize(&mut self, n: usize) {
        match &mut self.backing {
            Backing::Owned(v) => v.resize(n, 0),
            Backing::Chain(_) => {
                let mut flat = self.to_vec();
                flat.resize(n, 0);
                self.backing = Backing::Owned(flat);
            }
        }
    }

    /// 丢弃现有后备存储，成为输入字节的自有拷贝。
    pub fn assign(&mut self, src: &[u8]) {
        match &mut self.backing {
            // 复用已有向量的容量，稳态下不再分配。
            Backing::Owned(v) => {
                v.clear();
                v.extend_from_slice(src);
            }
            Backing::Chain(_) => {
                self.backing = Backing::Owned(src.to_vec());
            }
        }
    }

    /// 从网络栈缓冲 `src` 中移走至多 `n` 字节，零拷贝地接管为本缓冲的内容。
    ///
    /// ## 契约（What）
    /// - 原有内容被替换；返回实际移走的字节数 `min(n, src.len())`；
    /// - `src` 中剩余字节保持原状，可继续用于后续帧的解码。
    ///
    /// ## 做法（How）
    /// - `split_to` 切下前缀后 `freeze` 为只读分段，段内存仍归网络栈
    ///   缓冲的分配块所有，由引用计数延长寿命，不发生字节复制。
    pub fn consume(&mut self, src: &mut BytesMut, n: usize) -> usize {
        let take = n.min(src.len());
        if take == 0 {
            self.clear();
            return 0;
        }
        let seg = src.split_to(take).freeze();
        self.backing = Backing::Chain(vec![seg]);
        take
    }

    /// 在 `offset` 处写入 `len = src.len()` 字节；仅当整个区间落在现有
    /// 范围内时成功。
    ///
    /// 分段链形态先落为自有向量（内容不变）再写入。
    pub fn copyin(&mut self, src: &[u8], offset: usize) -> bool {
        let end = match offset.checked_add(src.len()) {
            Some(end) if end <= self.size() => end,
            _ => return false,
        };
        if let Backing::Chain(_) = self.backing {
            let flat = self.to_vec();
            self.backing = Backing::Owned(flat);
        }
        match &mut self.backing {
            Backing::Owned(v) => {
                v[offset..end].copy_from_slice(src);
                true
            }
            Backing::Chain(_) => unreachable!("chain was flattened above"),
        }
    }

    /// 从 `offset` 读出 `dst.len()` 字节；仅当整个区间可读时成功。
    pub fn copyout(&self, dst: &mut [u8], offset: usize) -> bool {
        self.copyout_shape(dst, offset, dst.len(), 0, 0, 1) == 1
    }

    /// 带形状的聚集读取。
    ///
    /// # 参数（What）
    /// - `ioffset`：输入起始偏移；
    /// - `esize`：单个元素的字节数，必须大于零；
    /// - `iskip`：输入侧每个元素之后跳过的字节数；
    /// - `dskip`：输出侧每个元素之后跳过的字节数；
    /// - `ecount`：期望的元素个数。
    ///
    /// # 返回值
    /// 实际产出的完整元素个数 `k`：受 `ecount`、输入剩余量与 `dst` 容量
    /// 三者共同约束，不产出任何残缺元素。
    pub fn copyout_shape(
        &self,
        dst: &mut [u8],
        ioffset: usize,
        esize: usize,
        iskip: usize,
        dskip: usize,
        ecount: usize,
    ) -> usize {
        if esize == 0 {
            return 0;
        }
        let total = self.size();
        let mut cursor = StrideCursor::new(self);
        if !cursor.seek(ioffset) {
            return 0;
        }
        let mut produced = 0usize;
        let mut in_pos = ioffset;
        let mut out_pos = 0usize;
        while produced < ecount {
            if in_pos + esize > total || out_pos + esize > dst.len() {
                break;
            }
            cursor.copy(&mut dst[out_pos..out_pos + esize]);
            produced += 1;
            in_pos += esize;
            out_pos += esize;
            if produced == ecount {
                break;
            }
            // 元素间的跳跃；越界则后续元素全部放弃。
            in_pos += iskip;
            out_pos += dskip;
            if in_pos > total || !cursor.skip(iskip) {
                break;
            }
        }
        produced
    }

    /// 将全部内容追加到外部字节缓冲尾部。
    pub fn append_to(&self, dst: &mut BytesMut) {
        match &self.backing {
            Backing::Owned(v) => dst.extend_from_slice(v),
            Backing::Chain(c) => {
                for seg in c {
                    dst.extend_from_slice(seg);
                }
            }
        }
    }

    /// 与 `other` 原子交换两者的后备存储。
    pub fn swap(&mut self, other: &mut DBuffer) {
        std::mem::swap(&mut self.backing, &mut other.backing);
    }

    /// 以只读分段序列的形式遍历内容。
    pub fn strides(&self) -> impl Iterator<Item = &[u8]> {
        // Owned 形态映射为至多一个分段，空缓冲产生空迭代。
        let (owned, chain): (Option<&[u8]>, &[Bytes]) = match &self.backing {
            Backing::Owned(v) if v.is_empty() => (None, &[]),
            Backing::Owned(v) => (Some(v.as_slice()), &[]),
            Backing::Chain(c) => (None, c.as_slice()),
        };
        owned
            .into_iter()
            .chain(chain.iter().map(|s| s.as_ref()))
    }

    /// 拷出全部内容为独立向量。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for s in self.strides() {
            out.extend_from_slice(s);
        }
        out
    }
}

/// 分段游标：跨段读取的内部状态。
///
/// 每次 `copy` 消耗 `min(段内剩余, 还需字节)` 并前进，保证复制永不越过
/// 段边界；`skip` 以同样的步进方式丢弃字节。
struct StrideCursor<'a> {
    segments: Vec<&'a [u8]>,
    seg: usize,
    off: usize,
}

impl<'a> StrideCursor<'a> {
    fn new(buf: &'a DBuffer) -> Self {
        StrideCursor {
            segments: buf.strides().collect(),
            seg: 0,
            off: 0,
        }
    }

    /// 从头定位到绝对偏移 `pos`；越界返回 `false`。
    fn seek(&mut self, pos: usize) -> bool {
        self.seg = 0;
        self.off = 0;
        self.skip(pos)
    }

    /// 前进 `n` 字节；剩余量不足时返回 `false`（游标停在末尾）。
    fn skip(&mut self, mut n: usize) -> bool {
        while n > 0 {
            let Some(seg) = self.segments.get(self.seg) else {
                return false;
            };
            let avail = seg.len() - self.off;
            let step = avail.min(n);
            self.off += step;
            n -= step;
            if self.off == seg.len() {
                self.seg += 1;
                self.off = 0;
            }
        }
        // n == 0 时仍需确认游标没有停在已经耗尽的虚位上。
        n == 0
    }

    /// 复制 `dst.len()` 字节。调用方负责保证剩余量充足。
    fn copy(&mut self, dst: &mut [u8]) {
        let mut filled = 0usize;
        while filled < dst.len() {
            let seg = self.segments[self.seg];
            let avail = seg.len() - self.off;
            let step = avail.min(dst.len() - filled);
            dst[filled..filled + step].copy_from_slice(&seg[self.off..self.off + step]);
            self.off += step;
            filled += step;
            if self.off == seg.len() {
                self.seg += 1;
                self.off = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chained(parts: &[&[u8]]) -> DBuffer {
        DBuffer::from_segments(parts.iter().map(|p| Bytes::copy_from_slice(p)))
    }

    #[test]
    fn consume_takes_ownership_without_copy() {
        let mut src = BytesMut::from(&b"hello world"[..]);
        let mut buf = DBuffer::new();
        assert_eq!(buf.consume(&mut src, 5), 5);
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.nstrides(), 1);
        assert_eq!(buf.to_vec(), b"hello");
        // 输入缓冲剩余部分保持原状。
        assert_eq!(&src[..], b" world");
    }

    #[test]
    fn resize_flattens_chain_into_owned() {
        let mut buf = chained(&[b"abc", b"defg"]);
        assert_eq!(buf.nstrides(), 2);
        buf.resize(5);
        assert_eq!(buf.nstrides(), 1);
        assert_eq!(buf.to_vec(), b"abcde");
        buf.resize(8);
        assert_eq!(buf.to_vec(), b"abcde\0\0\0");
    }

    #[test]
    fn copyin_rejects_out_of_range_writes() {
        let mut buf = DBuffer::zeroed(4);
        assert!(buf.copyin(b"ab", 2));
        assert!(!buf.copyin(b"ab", 3));
        assert_eq!(buf.to_vec(), b"\0\0ab");
    }

    #[test]
    fn copyout_shape_walks_across_segment_boundaries() {
        // 元素宽度 2，输入每元素后跳 1：0x0102 .. 0x0708，段边界故意切在元素中间。
        let buf = chained(&[&[1, 2, 3], &[4], &[5, 6, 7, 8, 9]]);
        let mut out = [0u8; 8];
        let k = buf.copyout_shape(&mut out, 0, 2, 1, 0, 4);
        assert_eq!(k, 3);
        assert_eq!(&out[..6], &[1, 2, 4, 5, 7, 8]);
    }

    #[test]
    fn copyout_shape_matches_pointwise_copyout() {
        let buf = chained(&[&[10, 11, 12, 13, 14], &[15, 16, 17, 18, 19, 20]]);
        let (off, esize, iskip, dskip, ec) = (1usize, 3usize, 2usize, 1usize, 4usize);
        let mut shaped = [0u8; 32];
        let k = buf.copyout_shape(&mut shaped, off, esize, iskip, dskip, ec);
        assert!(off + esize * k + iskip * (k.saturating_sub(1)) <= buf.size());
        assert!(k <= ec);
        for i in 0..k {
            let mut single = vec![0u8; esize];
            assert!(buf.copyout(&mut single, off + i * (esize + iskip)));
            let at = i * (esize + dskip);
            assert_eq!(&shaped[at..at + esize], &single[..]);
        }
    }

    #[test]
    fn copyout_shape_respects_destination_capacity() {
        let buf = chained(&[&[1, 2, 3, 4, 5, 6, 7, 8]]);
        let mut out = [0u8; 3];
        // 目的地只放得下一个完整元素。
        assert_eq!(buf.copyout_shape(&mut out, 0, 2, 0, 0, 4), 1);
        assert_eq!(&out[..2], &[1, 2]);
    }

    #[test]
    fn zero_esize_yields_nothing() {
        let buf = chained(&[&[1, 2, 3]]);
        let mut out = [0u8; 4];
        assert_eq!(buf.copyout_shape(&mut out, 0, 0, 0, 0, 4), 0);
    }

    #[test]
    fn swap_exchanges_backings() {
        let mut a = chained(&[b"abc"]);
        let mut b = DBuffer::zeroed(2);
        a.swap(&mut b);
        assert_eq!(a.size(), 2);
        assert_eq!(b.to_vec(), b"abc");
    }

    #[test]
    fn append_to_concatenates_all_segments() {
        let buf = chained(&[b"ab", b"cd"]);
        let mut dst = BytesMut::from(&b"x"[..]);
        buf.append_to(&mut dst);
        assert_eq!(&dst[..], b"xabcd");
    }
}
