use std::fmt;

/// 三维尺寸，用于描述工作组大小和工作组数量。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Dims3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Default for Dims3 {
    #[inline]
    fn default() -> Self {
        Self::ONE
    }
}

impl Dims3 {
    pub const ONE: Self = Self { x: 1, y: 1, z: 1 };

    #[inline]
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// 未给出的维度取 1，超过 3 维的部分被忽略。
    pub fn from_slice(dims: &[usize]) -> Self {
        let mut ans = Self::ONE;
        for (dst, &src) in [&mut ans.x, &mut ans.y, &mut ans.z].into_iter().zip(dims) {
            *dst = src;
        }
        ans
    }

    #[inline]
    pub const fn to_array(self) -> [usize; 3] {
        [self.x, self.y, self.z]
    }

    #[inline]
    pub fn get(&self, dim: usize) -> usize {
        self.to_array()[dim]
    }

    #[inline]
    pub fn product(&self) -> usize {
        self.x * self.y * self.z
    }
}

impl From<[usize; 3]> for Dims3 {
    #[inline]
    fn from([x, y, z]: [usize; 3]) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Dims3 {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// 执行路径需要的设备限制。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceLimits {
    pub max_threads_block: usize,
    pub max_block: Dims3,
    pub max_grid: Dims3,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_threads_block: 1024,
            max_block: Dims3::new(1024, 1024, 64),
            max_grid: Dims3::new(i32::MAX as _, 65535, 65535),
        }
    }
}

#[test]
fn test_from_slice() {
    assert_eq!(Dims3::from_slice(&[]), Dims3::ONE);
    assert_eq!(Dims3::from_slice(&[4]), Dims3::new(4, 1, 1));
    assert_eq!(Dims3::from_slice(&[4, 4]), Dims3::new(4, 4, 1));
    assert_eq!(Dims3::from_slice(&[2, 3, 5, 7]), Dims3::new(2, 3, 5));
    assert_eq!(Dims3::new(2, 3, 5).product(), 30);
    assert_eq!(Dims3::new(2, 3, 5).to_string(), "(2, 3, 5)");
}
