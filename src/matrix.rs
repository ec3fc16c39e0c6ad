// matrix.rs — Host-resident typed matrices and 2-D sizes.
//
// A `Matrix` is a width × height grid of elements whose type is known
// only at runtime (`ElemType`): the input RGBA image, the classifier's
// threshold / feature-id / leaf-value tables and any readback of a
// feature buffer all travel as matrices.
//
// Storage is a word (`u32`) vector so every 4-byte view (`f32`, `i32`,
// `[f32; 16]`, ...) is aligned; byte-sized element types simply round
// the word count up. The byte invariant is
//
//   bytes == w * h * channels * depth
//
// and every typed accessor slices exactly that many bytes.
//
// OWNERSHIP:
// A matrix either owns its words (`Storage::Owned`) or aliases a shared
// allocation made by someone else (`Storage::Shared`). An aliasing
// matrix never frees the words; dropping it only releases its `Arc`
// reference. Mutable access is only granted to owning matrices.
//
// NEW RUST CONCEPTS:
// - Associated consts on a trait (`Element::SCALAR`, `Element::LANES`)
//   to check at runtime that a typed view matches the matrix's tag.
// - `Arc<[u32]>`: a reference-counted slice, the safe way to let two
//   owners look at the same words.

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

/// Non-negative 2-D extent. Equality is component-wise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub w: usize,
    pub h: usize,
}

impl Size {
    pub const ZERO: Size = Size { w: 0, h: 0 };

    pub const fn new(w: usize, h: usize) -> Self {
        Size { w, h }
    }

    /// Number of cells, `w * h`.
    pub fn area(&self) -> usize {
        self.w * self.h
    }

    /// True when both extents are strictly positive.
    pub fn is_positive(&self) -> bool {
        self.w > 0 && self.h > 0
    }

    /// True when `other` fits inside `self` on both axes.
    pub fn contains(&self, other: Size) -> bool {
        self.w >= other.w && self.h >= other.h
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

// ---------------------------------------------------------------------------
// Element types
// ---------------------------------------------------------------------------

/// Scalar component of an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    U8,
    I32,
    F32,
}

impl Scalar {
    /// Bytes per scalar.
    pub fn depth(self) -> usize {
        match self {
            Scalar::U8 => 1,
            Scalar::I32 | Scalar::F32 => 4,
        }
    }
}

/// Runtime element type of a [`Matrix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    /// 8-bit mono.
    U8,
    /// 8-bit × 4 (packed RGBA).
    U8x4,
    I32,
    F32,
    F32x4,
    F32x8,
    F32x16,
}

impl ElemType {
    pub fn scalar(self) -> Scalar {
        match self {
            ElemType::U8 | ElemType::U8x4 => Scalar::U8,
            ElemType::I32 => Scalar::I32,
            ElemType::F32 | ElemType::F32x4 | ElemType::F32x8 | ElemType::F32x16 => Scalar::F32,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            ElemType::U8 | ElemType::I32 | ElemType::F32 => 1,
            ElemType::U8x4 | ElemType::F32x4 => 4,
            ElemType::F32x8 => 8,
            ElemType::F32x16 => 16,
        }
    }

    /// Bytes per channel.
    pub fn depth(self) -> usize {
        self.scalar().depth()
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        self.channels() * self.depth()
    }
}

/// Rust types that can view a matrix's storage.
///
/// A view of type `T` is valid when `T`'s scalar matches the matrix's
/// scalar and `T::LANES` divides the element's channel count; so an
/// `F32x16` matrix can be read as `f32`, `[f32; 4]` or `[f32; 16]`.
pub trait Element: Pod {
    const SCALAR: Scalar;
    const LANES: usize;
}

impl Element for u8 {
    const SCALAR: Scalar = Scalar::U8;
    const LANES: usize = 1;
}

impl Element for [u8; 4] {
    const SCALAR: Scalar = Scalar::U8;
    const LANES: usize = 4;
}

impl Element for i32 {
    const SCALAR: Scalar = Scalar::I32;
    const LANES: usize = 1;
}

impl Element for f32 {
    const SCALAR: Scalar = Scalar::F32;
    const LANES: usize = 1;
}

impl Element for [f32; 4] {
    const SCALAR: Scalar = Scalar::F32;
    const LANES: usize = 4;
}

impl Element for [f32; 8] {
    const SCALAR: Scalar = Scalar::F32;
    const LANES: usize = 8;
}

impl Element for [f32; 16] {
    const SCALAR: Scalar = Scalar::F32;
    const LANES: usize = 16;
}

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Storage {
    Owned(Vec<u32>),
    Shared(Arc<[u32]>),
}

impl Storage {
    fn words(&self) -> &[u32] {
        match self {
            Storage::Owned(v) => v.as_slice(),
            Storage::Shared(a) => &a[..],
        }
    }
}

fn words_for(bytes: usize) -> usize {
    (bytes + 3) / 4
}

/// Host matrix with a runtime element type.
///
/// `Clone` is shallow for aliasing matrices (another `Arc` reference)
/// and deep for owning ones; use [`Matrix::deep_copy`] to always copy.
#[derive(Debug, Clone)]
pub struct Matrix {
    elem: ElemType,
    size: Size,
    storage: Option<Storage>,
}

impl Matrix {
    // --- Constructors ---

    /// Matrix with no storage and zero size.
    pub fn empty(elem: ElemType) -> Self {
        Matrix { elem, size: Size::ZERO, storage: None }
    }

    /// Zero-initialised owning matrix.
    pub fn new(w: usize, h: usize, elem: ElemType) -> Self {
        let bytes = w * h * elem.size();
        Matrix {
            elem,
            size: Size::new(w, h),
            storage: Some(Storage::Owned(vec![0; words_for(bytes)])),
        }
    }

    /// Owning matrix built from typed data.
    ///
    /// # Panics
    /// Panics if `T` does not match `elem` or `data` holds the wrong
    /// number of values.
    pub fn from_vec<T: Element>(w: usize, h: usize, elem: ElemType, data: Vec<T>) -> Self {
        check_view::<T>(elem);
        let bytes = w * h * elem.size();
        assert_eq!(
            data.len() * std::mem::size_of::<T>(),
            bytes,
            "data holds {} values, a {w}x{h} {elem:?} matrix needs {}",
            data.len(),
            bytes / std::mem::size_of::<T>(),
        );
        let mut words = vec![0u32; words_for(bytes)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..bytes]
            .copy_from_slice(bytemuck::cast_slice(&data));
        Matrix { elem, size: Size::new(w, h), storage: Some(Storage::Owned(words)) }
    }

    /// Matrix aliasing caller-owned shared words. The matrix never frees
    /// them; the last `Arc` holder does.
    ///
    /// # Panics
    /// Panics if `words` is too short for `w * h` elements.
    pub fn shared(w: usize, h: usize, elem: ElemType, words: Arc<[u32]>) -> Self {
        let bytes = w * h * elem.size();
        assert!(
            words.len() * 4 >= bytes,
            "shared storage of {} bytes is too small for a {w}x{h} {elem:?} matrix",
            words.len() * 4
        );
        Matrix { elem, size: Size::new(w, h), storage: Some(Storage::Shared(words)) }
    }

    /// Owning copy of this matrix, regardless of how it is stored.
    pub fn deep_copy(&self) -> Self {
        let storage = self.storage.as_ref().map(|s| Storage::Owned(s.words().to_vec()));
        Matrix { elem: self.elem, size: self.size, storage }
    }

    // --- Accessors ---

    pub fn elem(&self) -> ElemType {
        self.elem
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn width(&self) -> usize {
        self.size.w
    }

    pub fn height(&self) -> usize {
        self.size.h
    }

    /// `w * h * channels * depth`.
    pub fn bytes(&self) -> usize {
        self.size.area() * self.elem.size()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_none() || self.bytes() == 0
    }

    /// True when the storage is aliased rather than owned.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.storage, Some(Storage::Shared(_)))
    }

    /// Raw bytes, exactly [`Matrix::bytes`] long.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Some(s) => &bytemuck::cast_slice::<u32, u8>(s.words())[..self.bytes()],
            None => &[],
        }
    }

    /// Typed read-only view.
    ///
    /// # Panics
    /// Panics if `T` does not match the element type.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        check_view::<T>(self.elem);
        match &self.storage {
            // A literal `&[]` of bytes is not aligned for wider `T`.
            None => &[],
            Some(_) => bytemuck::cast_slice(self.as_bytes()),
        }
    }

    /// Typed mutable view.
    ///
    /// # Panics
    /// Panics if `T` does not match the element type or the matrix is
    /// borrowed.
    pub fn as_mut_slice<T: Element>(&mut self) -> &mut [T] {
        check_view::<T>(self.elem);
        let bytes = self.bytes();
        match &mut self.storage {
            Some(Storage::Owned(words)) => {
                bytemuck::cast_slice_mut(&mut bytemuck::cast_slice_mut::<u32, u8>(words)[..bytes])
            }
            Some(Storage::Shared(_)) => panic!("cannot mutate a borrowed matrix"),
            None => &mut [],
        }
    }

    /// Element at `(x, y)` viewed as `T` (one `T` per element).
    ///
    /// # Panics
    /// Panics if out of bounds or `T` is not a whole-element view.
    pub fn get<T: Element>(&self, x: usize, y: usize) -> T {
        assert_eq!(T::LANES, self.elem.channels(), "get() needs a whole-element view");
        assert!(
            x < self.size.w && y < self.size.h,
            "({x}, {y}) out of bounds for {} matrix",
            self.size
        );
        self.as_slice::<T>()[y * self.size.w + x]
    }

    /// Row `y` as a typed slice.
    pub fn row<T: Element>(&self, y: usize) -> &[T] {
        assert!(y < self.size.h, "row {y} out of bounds (height {})", self.size.h);
        let per_row = self.size.w * self.elem.channels() / T::LANES;
        &self.as_slice::<T>()[y * per_row..(y + 1) * per_row]
    }
}

fn check_view<T: Element>(elem: ElemType) {
    assert!(
        T::SCALAR == elem.scalar() && elem.channels() % T::LANES == 0,
        "type mismatch: cannot view {elem:?} as {}",
        std::any::type_name::<T>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elem_sizes() {
        assert_eq!(ElemType::U8.size(), 1);
        assert_eq!(ElemType::U8x4.size(), 4);
        assert_eq!(ElemType::I32.size(), 4);
        assert_eq!(ElemType::F32x8.size(), 32);
        assert_eq!(ElemType::F32x16.size(), 64);
    }

    #[test]
    fn test_bytes_invariant() {
        let m = Matrix::new(3, 5, ElemType::F32x4);
        assert_eq!(m.bytes(), 3 * 5 * 4 * 4);
        assert_eq!(m.as_bytes().len(), m.bytes());
        let odd = Matrix::new(3, 3, ElemType::U8);
        assert_eq!(odd.as_bytes().len(), 9);
    }

    #[test]
    fn test_empty_matrix() {
        let m = Matrix::empty(ElemType::F32);
        assert!(m.is_empty());
        assert_eq!(m.bytes(), 0);
        assert!(m.as_slice::<f32>().is_empty());
        assert!(m.as_bytes().is_empty());
    }

    #[test]
    fn test_empty_matrix_wide_views() {
        let mut m = Matrix::empty(ElemType::F32x16);
        assert!(m.as_slice::<[f32; 16]>().is_empty());
        assert!(m.as_slice::<f32>().is_empty());
        assert!(m.as_mut_slice::<[f32; 16]>().is_empty());
        let mut m = Matrix::empty(ElemType::I32);
        assert!(m.as_mut_slice::<i32>().is_empty());
    }

    #[test]
    fn test_from_vec_and_views() {
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let m = Matrix::from_vec(2, 2, ElemType::F32x4, data);
        assert_eq!(m.get::<[f32; 4]>(1, 0), [4.0, 5.0, 6.0, 7.0]);
        assert_eq!(m.as_slice::<f32>()[15], 15.0);
        assert_eq!(m.row::<f32>(1), &[8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
    }

    #[test]
    fn test_rgba_bytes() {
        let m = Matrix::from_vec(2, 1, ElemType::U8x4, vec![[1u8, 2, 3, 4], [5, 6, 7, 8]]);
        assert_eq!(m.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(m.get::<[u8; 4]>(1, 0), [5, 6, 7, 8]);
    }

    #[test]
    fn test_shared_storage_is_borrowed() {
        let words: Arc<[u32]> = Arc::from(vec![0u32; 8]);
        let m = Matrix::shared(8, 1, ElemType::I32, Arc::clone(&words));
        assert!(m.is_borrowed());
        assert_eq!(Arc::strong_count(&words), 2);
        let owned = m.deep_copy();
        assert!(!owned.is_borrowed());
        drop(m);
        assert_eq!(Arc::strong_count(&words), 1);
    }

    #[test]
    #[should_panic(expected = "borrowed")]
    fn test_mutating_borrowed_panics() {
        let words: Arc<[u32]> = Arc::from(vec![0u32; 4]);
        let mut m = Matrix::shared(4, 1, ElemType::F32, words);
        m.as_mut_slice::<f32>()[0] = 1.0;
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_wrong_view_panics() {
        let m = Matrix::new(2, 2, ElemType::I32);
        let _ = m.as_slice::<f32>();
    }

    #[test]
    #[should_panic(expected = "needs")]
    fn test_from_vec_wrong_len_panics() {
        Matrix::from_vec(2, 2, ElemType::F32, vec![0.0f32; 3]);
    }

    #[test]
    fn test_size_display_and_contains() {
        let s = Size::new(64, 48);
        assert_eq!(s.to_string(), "64x48");
        assert!(s.contains(Size::new(64, 10)));
        assert!(!s.contains(Size::new(65, 10)));
        assert_eq!(s.area(), 3072);
    }
}
