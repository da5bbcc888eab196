//! Host-side half of the GPU readback: the dimension-keyed staging surface cache and the
//! row-pitch stripping copy.

use super::{CaptureError, BYTES_PER_PIXEL};

/// Copy `height` rows of `width` pixels out of a mapped surface whose rows are `row_pitch`
/// bytes apart, dropping the padding.
pub fn pack_rows(
    mapped: &[u8],
    row_pitch: usize,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, CaptureError> {
    let row_len = width as usize * BYTES_PER_PIXEL;
    let height = height as usize;

    if row_pitch < row_len {
        return Err(CaptureError::Staging(format!(
            "row pitch {row_pitch} is shorter than a {width}-pixel row"
        )));
    }
    let needed = match height {
        0 => 0,
        h => row_pitch * (h - 1) + row_len,
    };
    if mapped.len() < needed {
        return Err(CaptureError::Staging(format!(
            "mapped surface holds {} bytes, {needed} required",
            mapped.len()
        )));
    }

    if row_pitch == row_len {
        return Ok(mapped[..row_len * height].to_vec());
    }

    let mut packed = Vec::with_capacity(row_len * height);
    for row in mapped.chunks(row_pitch).take(height) {
        packed.extend_from_slice(&row[..row_len]);
    }
    Ok(packed)
}

/// A staging surface reused until the frame dimensions change.
pub struct StagingCache<T> {
    current: Option<(u32, u32, T)>,
}

impl<T> Default for StagingCache<T> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<T> StagingCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.current.as_ref().map(|&(w, h, _)| (w, h))
    }

    pub fn get_or_create<E>(
        &mut self,
        width: u32,
        height: u32,
        create: impl FnOnce(u32, u32) -> Result<T, E>,
    ) -> Result<&T, E> {
        let entry = match self.current.take() {
            Some(entry) if (entry.0, entry.1) == (width, height) => entry,
            // The old surface is released before its replacement is created.
            _ => (width, height, create(width, height)?),
        };
        Ok(&self.current.insert(entry).2)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tight_rows_are_copied_verbatim() {
        let mapped: Vec<u8> = (0..16).collect();
        assert_eq!(pack_rows(&mapped, 8, 2, 2).unwrap(), mapped);
    }

    #[test]
    fn padding_is_stripped() {
        // 1 pixel wide, pitch 8: each row is 4 pixel bytes then 4 padding bytes.
        let mapped = [1, 2, 3, 4, 0xEE, 0xEE, 0xEE, 0xEE, 5, 6, 7, 8];
        assert_eq!(pack_rows(&mapped, 8, 1, 2).unwrap(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn short_mapping_is_an_error() {
        assert!(pack_rows(&[0; 10], 8, 1, 2).is_err());
        assert!(pack_rows(&[0; 16], 4, 2, 2).is_err());
    }

    #[test]
    fn empty_frame_packs_to_nothing() {
        assert!(pack_rows(&[], 64, 16, 0).unwrap().is_empty());
    }

    #[test]
    fn surface_is_reused_for_same_dimensions() {
        let mut cache = StagingCache::new();
        let mut created = 0;
        for _ in 0..3 {
            cache
                .get_or_create(640, 480, |w, h| {
                    created += 1;
                    Ok::<_, ()>((w, h))
                })
                .unwrap();
        }
        assert_eq!(created, 1);
    }

    #[test]
    fn reused_surface_is_the_cached_one() {
        let mut cache = StagingCache::new();
        let mut next = 0u32;
        let mut make = |_: u32, _: u32| {
            next += 1;
            Ok::<_, ()>(next)
        };
        assert_eq!(*cache.get_or_create(4, 4, &mut make).unwrap(), 1);
        assert_eq!(*cache.get_or_create(4, 4, &mut make).unwrap(), 1);
        assert_eq!(*cache.get_or_create(8, 4, &mut make).unwrap(), 2);
        assert_eq!(*cache.get_or_create(8, 4, &mut make).unwrap(), 2);
    }

    #[test]
    fn surface_is_recreated_on_resize() {
        let mut cache = StagingCache::new();
        cache.get_or_create(640, 480, |w, h| Ok::<_, ()>((w, h))).unwrap();
        let surface = cache.get_or_create(800, 600, |w, h| Ok::<_, ()>((w, h))).unwrap();
        assert_eq!(*surface, (800, 600));
        assert_eq!(cache.dimensions(), Some((800, 600)));
    }

    #[test]
    fn failed_creation_leaves_cache_empty() {
        let mut cache = StagingCache::new();
        cache.get_or_create(1, 1, |_, _| Ok::<_, ()>(1)).unwrap();
        assert!(cache.get_or_create(2, 2, |_, _| Err::<u8, _>("oom")).is_err());
        assert_eq!(cache.dimensions(), None);
    }
}
