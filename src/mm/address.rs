//! 物理/虚拟地址、页号以及运行时页几何

use core::fmt::{self, Debug, Formatter};

/// 运行时确定的页大小及其派生量
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PageGeometry {
    pub size: usize,
    pub shift: usize,
    pub mask: usize,
}

impl PageGeometry {
    /// 页大小必须非零且是 2 的幂，否则返回 `None`
    pub const fn new(size: usize) -> Option<Self> {
        if size == 0 || !size.is_power_of_two() {
            return None;
        }
        Some(Self {
            size,
            shift: size.trailing_zeros() as usize,
            mask: size - 1,
        })
    }
    pub const fn trunc(&self, x: usize) -> usize {
        x & !self.mask
    }
    pub const fn round(&self, x: usize) -> usize {
        (x + self.mask) & !self.mask
    }
    /// 字节数换算为页数（向下取整）
    pub const fn atop(&self, x: usize) -> usize {
        x >> self.shift
    }
    /// 页数换算为字节数
    pub const fn ptoa(&self, n: usize) -> usize {
        n << self.shift
    }
    pub const fn is_aligned(&self, x: usize) -> bool {
        x & self.mask == 0
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default, Hash)]
pub struct PhysAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default, Hash)]
pub struct VirtAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default, Hash)]
pub struct PhysPageNum(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default, Hash)]
pub struct VirtPageNum(pub usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PA:{:#x}", self.0))
    }
}
impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VA:{:#x}", self.0))
    }
}
impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PPN:{:#x}", self.0))
    }
}
impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VPN:{:#x}", self.0))
    }
}

impl From<usize> for PhysAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<usize> for VirtAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<usize> for PhysPageNum {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<usize> for VirtPageNum {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<PhysAddr> for usize {
    fn from(v: PhysAddr) -> Self {
        v.0
    }
}
impl From<VirtAddr> for usize {
    fn from(v: VirtAddr) -> Self {
        v.0
    }
}

impl VirtAddr {
    pub fn floor(&self, g: PageGeometry) -> VirtPageNum {
        VirtPageNum(g.atop(self.0))
    }
    pub fn ceil(&self, g: PageGeometry) -> VirtPageNum {
        VirtPageNum(g.atop(g.round(self.0)))
    }
    pub fn page_offset(&self, g: PageGeometry) -> usize {
        self.0 & g.mask
    }
    pub fn offset(&self, bytes: usize) -> VirtAddr {
        VirtAddr(self.0 + bytes)
    }
}

impl PhysAddr {
    pub fn floor(&self, g: PageGeometry) -> PhysPageNum {
        PhysPageNum(g.atop(self.0))
    }
    pub fn offset(&self, bytes: usize) -> PhysAddr {
        PhysAddr(self.0 + bytes)
    }
}

impl PhysPageNum {
    pub fn addr(&self, g: PageGeometry) -> PhysAddr {
        PhysAddr(g.ptoa(self.0))
    }
}

impl VirtPageNum {
    pub fn addr(&self, g: PageGeometry) -> VirtAddr {
        VirtAddr(g.ptoa(self.0))
    }
}

pub trait StepByOne {
    fn step(&mut self);
}
impl StepByOne for VirtPageNum {
    fn step(&mut self) {
        self.0 += 1;
    }
}
impl StepByOne for PhysPageNum {
    fn step(&mut self) {
        self.0 += 1;
    }
}

/// 左闭右开的页号区间
#[derive(Copy, Clone)]
pub struct SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    l: T,
    r: T,
}

impl<T> SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    pub fn new(start: T, end: T) -> Self {
        assert!(start <= end, "start {:?} > end {:?}!", start, end);
        Self { l: start, r: end }
    }
}

impl<T> IntoIterator for SimpleRange<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    type IntoIter = SimpleRangeIterator<T>;
    fn into_iter(self) -> Self::IntoIter {
        SimpleRangeIterator::new(self.l, self.r)
    }
}

pub struct SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    current: T,
    end: T,
}

impl<T> SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    pub fn new(l: T, r: T) -> Self {
        Self { current: l, end: r }
    }
}

impl<T> Iterator for SimpleRangeIterator<T>
where
    T: StepByOne + Copy + PartialEq + PartialOrd + Debug,
{
    type Item = T;
    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.end {
            None
        } else {
            let t = self.current;
            self.current.step();
            Some(t)
        }
    }
}

pub type VPNRange = SimpleRange<VirtPageNum>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_bad_sizes() {
        assert!(PageGeometry::new(0).is_none());
        assert!(PageGeometry::new(4095).is_none());
        assert!(PageGeometry::new(6144).is_none());
        let g = PageGeometry::new(4096).unwrap();
        assert_eq!(g.shift, 12);
        assert_eq!(g.mask, 0xfff);
    }

    #[test]
    fn geometry_rounding() {
        let g = PageGeometry::new(8192).unwrap();
        assert_eq!(g.round(1), 8192);
        assert_eq!(g.round(8192), 8192);
        assert_eq!(g.trunc(8193), 8192);
        assert_eq!(g.atop(3 * 8192 + 5), 3);
        let va = VirtAddr(0x5001);
        assert_eq!(va.floor(g), VirtPageNum(2));
        assert_eq!(va.ceil(g), VirtPageNum(3));
        assert_eq!(va.page_offset(g), 0x1001);
    }

    #[test]
    fn vpn_range_iterates_half_open() {
        let r = VPNRange::new(VirtPageNum(10), VirtPageNum(13));
        let v: alloc::vec::Vec<_> = r.into_iter().collect();
        assert_eq!(v, [VirtPageNum(10), VirtPageNum(11), VirtPageNum(12)]);
    }
}
