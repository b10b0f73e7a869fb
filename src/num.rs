use bytemuck::Pod;
use half::{bf16, f16};
use safetensors::Dtype;

pub trait Scalar: Sized + Clone + Copy + Pod + Send + Sync + sealed::Sealed {
    /// Size of the type in bytes.
    fn size() -> usize {
        std::mem::size_of::<Self>()
    }

    const DATA_TYPE: Dtype;
}

impl Scalar for f32 {
    const DATA_TYPE: Dtype = Dtype::F32;
}
impl Scalar for f16 {
    const DATA_TYPE: Dtype = Dtype::F16;
}
impl Scalar for bf16 {
    const DATA_TYPE: Dtype = Dtype::BF16;
}

/// Floating point types weights can be stored in. All arithmetic happens in `f32`.
pub trait Float: Scalar + Hom<f32> + CoHom<f32> + PartialEq + std::fmt::Debug {}

impl Float for f32 {}
impl Float for f16 {}
impl Float for bf16 {}

pub trait Hom<Into> {
    fn hom(self) -> Into;
}

impl Hom<f32> for f32 {
    #[inline]
    fn hom(self) -> f32 {
        self
    }
}

impl Hom<f16> for f32 {
    #[inline]
    fn hom(self) -> f16 {
        f16::from_f32(self)
    }
}

impl Hom<bf16> for f32 {
    #[inline]
    fn hom(self) -> bf16 {
        bf16::from_f32(self)
    }
}

impl Hom<f32> for f16 {
    #[inline]
    fn hom(self) -> f32 {
        self.to_f32()
    }
}

impl Hom<f32> for bf16 {
    #[inline]
    fn hom(self) -> f32 {
        self.to_f32()
    }
}

pub trait CoHom<From> {
    fn co_hom(value: From) -> Self;
}

impl<From, Into> CoHom<From> for Into
where
    From: Hom<Into>,
{
    #[inline]
    fn co_hom(value: From) -> Self {
        value.hom()
    }
}

/// Decodes raw little-endian bytes of type `dt` into `f32`s.
///
/// Returns `None` if the type is not a float type or the byte length doesn't fit.
pub fn decode_f32(dt: Dtype, data: &[u8]) -> Option<Vec<f32>> {
    fn cast<T: Float>(data: &[u8]) -> Option<Vec<f32>> {
        if data.len() % T::size() != 0 {
            return None;
        }
        // the source may not be aligned for `T`
        let data: Vec<T> = bytemuck::pod_collect_to_vec(data);
        Some(data.into_iter().map(Hom::hom).collect())
    }

    match dt {
        Dtype::F32 => cast::<f32>(data),
        Dtype::F16 => cast::<f16>(data),
        Dtype::BF16 => cast::<bf16>(data),
        _ => None,
    }
}

mod sealed {
    use half::{bf16, f16};

    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f16 {}
    impl Sealed for bf16 {}
}
