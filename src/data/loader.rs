use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;

use super::{ImageSet, Sample, load_image};
use crate::{QuakeErr, Result};

/// A labeled batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `(N, 3, size, size)` normalized images.
    pub images: Array4<f32>,
    pub labels: Array1<f32>,
    /// `(N, width)` auxiliary parameters, if the set has any.
    pub aux: Option<Array2<f32>>,
}

/// A batch identified by the images' reference table keys instead of labels.
#[derive(Debug, Clone, PartialEq)]
pub struct TestBatch {
    pub images: Array4<f32>,
    pub ids: Vec<String>,
    pub aux: Option<Array2<f32>>,
}

/// Splits an `ImageSet` in fixed size batches, decoding the images of each batch as it's
/// requested.
#[derive(Debug, Clone)]
pub struct DataLoader {
    set: ImageSet,
    batch_size: usize,
    image_size: u32,
    shuffle: Option<StdRng>,
}

impl DataLoader {
    /// Creates a new `DataLoader` that yields the images in order.
    ///
    /// # Arguments
    /// * `set` - The images to load.
    /// * `batch_size` - The amount of images per batch, the last one may be smaller.
    /// * `image_size` - The side images are resized to.
    pub fn new(set: ImageSet, batch_size: usize, image_size: u32) -> Self {
        Self {
            set,
            batch_size: batch_size.max(1),
            image_size,
            shuffle: None,
        }
    }

    /// Reorders the images every pass, following a generator seeded with `seed`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// The amount of batches in a pass.
    pub fn len(&self) -> usize {
        self.set.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    fn order(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.set.len()).collect();
        if let Some(rng) = &mut self.shuffle {
            order.shuffle(rng);
        }

        order
    }

    /// Starts a pass yielding labeled batches.
    pub fn batches(&mut self) -> Batches<'_> {
        Batches {
            order: self.order(),
            pos: 0,
            set: &self.set,
            batch_size: self.batch_size,
            image_size: self.image_size,
        }
    }

    /// Starts a pass yielding identified batches.
    pub fn test_batches(&mut self) -> TestBatches<'_> {
        TestBatches {
            order: self.order(),
            pos: 0,
            set: &self.set,
            batch_size: self.batch_size,
            image_size: self.image_size,
        }
    }
}

/// The labeled batches of one pass.
pub struct Batches<'a> {
    set: &'a ImageSet,
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
    image_size: u32,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = next_chunk(&self.order, &mut self.pos, self.batch_size)?;
        let samples: Vec<&Sample> = chunk.iter().map(|&i| &self.set.samples()[i]).collect();

        Some(labeled_batch(&samples, self.image_size))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.pos).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// The identified batches of one pass.
pub struct TestBatches<'a> {
    set: &'a ImageSet,
    order: Vec<usize>,
    pos: usize,
    batch_size: usize,
    image_size: u32,
}

impl Iterator for TestBatches<'_> {
    type Item = Result<TestBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = next_chunk(&self.order, &mut self.pos, self.batch_size)?;
        let samples: Vec<&Sample> = chunk.iter().map(|&i| &self.set.samples()[i]).collect();

        Some(test_batch(&samples, self.image_size))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.pos).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for TestBatches<'_> {}

fn next_chunk<'o>(order: &'o [usize], pos: &mut usize, batch_size: usize) -> Option<&'o [usize]> {
    if *pos >= order.len() {
        return None;
    }

    let end = (*pos + batch_size).min(order.len());
    let chunk = &order[*pos..end];
    *pos = end;
    Some(chunk)
}

fn labeled_batch(samples: &[&Sample], image_size: u32) -> Result<Batch> {
    let labels = samples
        .iter()
        .map(|sample| {
            sample
                .label
                .ok_or_else(|| QuakeErr::InvalidConfig(format!("{} has no label", sample.id)))
        })
        .collect::<Result<Array1<f32>>>()?;

    Ok(Batch {
        images: decode(samples, image_size)?,
        labels,
        aux: aux_rows(samples)?,
    })
}

fn test_batch(samples: &[&Sample], image_size: u32) -> Result<TestBatch> {
    Ok(TestBatch {
        images: decode(samples, image_size)?,
        ids: samples.iter().map(|sample| sample.id.clone()).collect(),
        aux: aux_rows(samples)?,
    })
}

/// Decodes the images of `samples` in parallel and stacks them.
fn decode(samples: &[&Sample], image_size: u32) -> Result<Array4<f32>> {
    let images: Vec<Array3<f32>> = samples
        .par_iter()
        .map(|sample| load_image(&sample.path, image_size))
        .collect::<Result<_>>()?;

    let views: Vec<ArrayView3<f32>> = images.iter().map(|image| image.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

fn aux_rows(samples: &[&Sample]) -> Result<Option<Array2<f32>>> {
    let Some(width) = samples.first().and_then(|s| s.aux.as_ref()).map(Vec::len) else {
        return Ok(None);
    };

    let mut values = Vec::with_capacity(samples.len() * width);
    for sample in samples {
        let row = sample.aux.as_ref().filter(|row| row.len() == width).ok_or(
            QuakeErr::BatchMismatch {
                what: "auxiliary parameters width",
                got: sample.aux.as_ref().map_or(0, Vec::len),
                expected: width,
            },
        )?;
        values.extend_from_slice(row);
    }

    Ok(Some(Array2::from_shape_vec((samples.len(), width), values)?))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{reference::ReferenceTable, target::Target};

    fn write_images(dir: &Path, count: usize) -> ReferenceTable {
        let mut table = ReferenceTable::default();

        for i in 0..count {
            let name = format!("img{i}.png");
            RgbImage::from_pixel(4, 4, Rgb([i as u8 * 20, 0, 0]))
                .save(dir.join(&name))
                .unwrap();
            table.insert(name, [i as f64, 10. * i as f64, -(i as f64), i as f64 / 2.]);
        }

        table
    }

    #[test]
    fn batches_cover_the_set_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let table = write_images(dir.path(), 5);
        let set = ImageSet::labeled(dir.path(), &table, Target::Mag, &[Target::Dep, Target::Lat])
            .unwrap();

        let mut loader = DataLoader::new(set, 2, 3);
        assert_eq!(loader.len(), 3);

        let batches = loader.batches();
        assert_eq!(batches.len(), 3);

        let batches: Vec<Batch> = batches.collect::<Result<_>>().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.labels.len()).collect();
        assert_eq!(sizes, [2, 2, 1]);

        assert_eq!(batches[0].images.dim(), (2, 3, 3, 3));
        assert_eq!(batches[1].labels.to_vec(), [2., 3.]);
        assert_eq!(batches[2].aux.as_ref().unwrap().row(0).to_vec(), [40., 2.]);
    }

    #[test]
    fn shuffling_reorders_every_pass() {
        let dir = tempfile::tempdir().unwrap();
        let table = write_images(dir.path(), 8);
        let set = ImageSet::unlabeled(dir.path(), &table, &[]).unwrap();

        let mut loader = DataLoader::new(set, 8, 2).shuffle(3);
        let mut pass = || -> Vec<String> {
            let batch = loader.test_batches().next().unwrap().unwrap();
            assert!(batch.aux.is_none());
            batch.ids
        };

        let first = pass();
        let second = pass();

        let mut sorted = first.clone();
        sorted.sort();
        let mut other = second.clone();
        other.sort();
        assert_eq!(sorted, other);
        assert_ne!(first, second);
    }

    #[test]
    fn unlabeled_sets_only_make_test_batches() {
        let dir = tempfile::tempdir().unwrap();
        let table = write_images(dir.path(), 2);
        let set = ImageSet::unlabeled(dir.path(), &table, &[]).unwrap();

        let mut loader = DataLoader::new(set, 4, 2);
        assert!(loader.batches().next().unwrap().is_err());
        assert_eq!(loader.test_batches().next().unwrap().unwrap().ids, ["img0.png", "img1.png"]);
    }

    #[test]
    fn empty_sets_yield_nothing() {
        let mut loader = DataLoader::new(ImageSet::default(), 4, 2);
        assert!(loader.is_empty());
        assert_eq!(loader.batches().count(), 0);
    }
}
