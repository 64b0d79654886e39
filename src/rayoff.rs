//! Single-threaded stand-ins for the bits of `rayon` and `thread_local` used when the `threads` feature is off
use once_cell::unsync::OnceCell;
use std::slice::ChunksMut;

pub(crate) struct ThreadLocal<T>(OnceCell<T>);

impl<T> ThreadLocal<T> {
    #[inline(always)]
    pub fn new() -> Self {
        Self(OnceCell::new())
    }

    #[inline(always)]
    pub fn get_or(&self, f: impl FnOnce() -> T) -> &T {
        self.0.get_or_init(f)
    }

    #[inline(always)]
    pub fn get_or_try<E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        self.0.get_or_try_init(f)
    }
}

impl<T> IntoIterator for ThreadLocal<T> {
    type Item = T;
    type IntoIter = std::option::IntoIter<T>;

    #[inline(always)]
    fn into_iter(mut self) -> Self::IntoIter {
        self.0.take().into_iter()
    }
}

pub(crate) trait FakeRayonIter: Sized {
    fn par_bridge(self) -> Self;
}

impl<I: Iterator> FakeRayonIter for I {
    #[inline(always)]
    fn par_bridge(self) -> Self {
        self
    }
}

pub(crate) trait FakeRayonChunks<T> {
    fn par_chunks_mut(&mut self, chunk_size: usize) -> ChunksMut<'_, T>;
}

impl<T> FakeRayonChunks<T> for [T] {
    #[inline(always)]
    fn par_chunks_mut(&mut self, chunk_size: usize) -> ChunksMut<'_, T> {
        self.chunks_mut(chunk_size)
    }
}

#[test]
fn behaves_like_one_thread() {
    let tls = ThreadLocal::new();
    assert_eq!(1, *tls.get_or(|| 1));
    assert_eq!(1, *tls.get_or(|| 2));
    assert_eq!(Ok::<_, ()>(&1), tls.get_or_try(|| Ok(3)));
    assert_eq!(vec![1], tls.into_iter().collect::<Vec<_>>());

    let mut items = [1u8, 2, 3, 4, 5];
    assert_eq!(3, items.par_chunks_mut(2).count());
    assert_eq!(15u32, items.iter().map(|&x| u32::from(x)).par_bridge().sum::<u32>());
}
