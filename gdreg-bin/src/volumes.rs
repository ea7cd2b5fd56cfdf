// SPDX-License-Identifier: MPL-2.0

//! Volume file adapter: NIfTI for 3-D/4-D data, grayscale PNG/JPEG for 2-D.
//!
//! Implements the engine's `VolumeSource` / `VolumeSink` traits. NIfTI
//! geometry comes from the sform rows when present; the affine is converted
//! from the file's RAS convention into the engine's internal LPS.

use std::path::Path;

use gdreg::error::{RegError, Result};
use gdreg::img::{Geometry, Image};
use gdreg::io::{VolumeSink, VolumeSource};
use nalgebra::{DMatrix, DVector};
use ndarray::{ArrayD, IxDyn};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

pub struct FileVolumes;

fn input_err<E: std::fmt::Display>(path: &Path, e: E) -> RegError {
    RegError::Input(format!("{}: {}", path.display(), e))
}

fn is_nifti(path: &Path) -> bool {
    let name = path.to_string_lossy().to_lowercase();
    name.ends_with(".nii") || name.ends_with(".nii.gz") || name.ends_with(".hdr")
}

fn is_png_like(path: &Path) -> bool {
    let name = path.to_string_lossy().to_lowercase();
    name.ends_with(".png") || name.ends_with(".jpg") || name.ends_with(".jpeg")
}

/// Geometry of the first `dim` axes from a NIfTI header, in LPS.
fn geometry_from_header(header: &NiftiHeader, size: &[usize], dim: usize) -> Result<Geometry> {
    let mut origin = DVector::zeros(dim);
    let mut spacing = DVector::from_element(dim, 1.0);
    let mut direction = DMatrix::identity(dim, dim);

    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let spatial = dim.min(3);
        // RAS rows; the first two are negated to land in LPS.
        for r in 0..spatial {
            let sign = if r < 2 { -1.0 } else { 1.0 };
            origin[r] = sign * rows[r][3] as f64;
            for c in 0..spatial {
                direction[(r, c)] = sign * rows[r][c] as f64;
            }
        }
        for c in 0..spatial {
            let mut norm = 0.0f64;
            for r in 0..spatial {
                norm += direction[(r, c)] * direction[(r, c)];
            }
            let norm = norm.sqrt();
            if norm <= 0.0 {
                return Err(RegError::Input("degenerate sform in NIfTI header".into()));
            }
            spacing[c] = norm;
            for r in 0..spatial {
                direction[(r, c)] /= norm;
            }
        }
    } else {
        for a in 0..dim.min(3) {
            let p = header.pixdim[a + 1] as f64;
            if p > 0.0 {
                spacing[a] = p;
            }
        }
    }
    if dim == 4 {
        let p = header.pixdim[4] as f64;
        spacing[3] = if p > 0.0 { p } else { 1.0 };
    }
    Geometry::new(size.to_vec(), origin, spacing, direction)
}

fn read_nifti(path: &Path, dim: usize) -> Result<Image> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| input_err(path, e))?;
    let header = obj.header().clone();
    let data: ArrayD<f32> = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| input_err(path, e))?;

    let shape = data.shape().to_vec();
    if shape.len() < dim {
        return Err(RegError::Input(format!(
            "{}: volume has {} axes, expected at least {}",
            path.display(),
            shape.len(),
            dim
        )));
    }
    let size = shape[..dim].to_vec();
    let channels: usize = shape[dim..].iter().product::<usize>().max(1);
    let geom = geometry_from_header(&header, &size, dim)?;

    let mut img = Image::zeros(geom, channels);
    let trailing = &shape[dim..];
    {
        let geom = img.geometry().clone();
        for (idx, &v) in data.indexed_iter() {
            let mut vi = 0usize;
            let mut stride = 1usize;
            for a in 0..dim {
                vi += idx[a] * stride;
                stride *= geom.size()[a];
            }
            // Row-major flattening of the trailing axes selects the channel.
            let mut c = 0usize;
            for (a, &n) in trailing.iter().enumerate() {
                c = c * n + idx[dim + a];
            }
            img.set(vi, c, v);
        }
    }
    Ok(img)
}

fn header_from_geometry(geom: &Geometry, channels: usize) -> NiftiHeader {
    let d = geom.ndim();
    let mut header = NiftiHeader::default();
    let ndim = if channels > 1 { d + 1 } else { d };
    header.dim = [1; 8];
    header.dim[0] = ndim as u16;
    for a in 0..d {
        header.dim[a + 1] = geom.size()[a] as u16;
    }
    if channels > 1 {
        header.dim[d + 1] = channels as u16;
    }
    header.pixdim = [1.0; 8];
    for a in 0..d {
        header.pixdim[a + 1] = geom.spacing()[a] as f32;
    }
    // LPS -> RAS rows for the sform.
    let (affine, origin) = geom.index_to_physical_affine();
    let spatial = d.min(3);
    let mut rows = [[0.0f32; 4]; 3];
    for r in 0..spatial {
        let sign = if r < 2 { -1.0 } else { 1.0 };
        rows[r][3] = (sign * origin[r]) as f32;
        for c in 0..spatial {
            rows[r][c] = (sign * affine[(r, c)]) as f32;
        }
    }
    if spatial < 3 {
        rows[2][2] = 1.0;
    }
    header.srow_x = rows[0];
    header.srow_y = rows[1];
    header.srow_z = rows[2];
    header.sform_code = 1;
    header
}

fn write_nifti(path: &Path, img: &Image) -> Result<()> {
    let geom = img.geometry();
    let d = geom.ndim();
    let channels = img.channels();
    let mut shape = geom.size().to_vec();
    if channels > 1 {
        shape.push(channels);
    }
    let mut data = ArrayD::zeros(IxDyn(&shape));
    let mut idx = vec![0usize; d];
    for vi in 0..img.voxel_count() {
        geom.delinearize(vi, &mut idx);
        for c in 0..channels {
            let mut full = idx.clone();
            if channels > 1 {
                full.push(c);
            }
            data[IxDyn(&full)] = img.get(vi, c);
        }
    }
    let header = header_from_geometry(geom, channels);
    nifti::writer::WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&data)
        .map_err(|e| input_err(path, e))?;
    Ok(())
}

fn read_png(path: &Path) -> Result<Image> {
    let dyn_img = image::open(path).map_err(|e| input_err(path, e))?;
    let (data, width, height) = match dyn_img {
        image::DynamicImage::ImageLuma16(img) => {
            let (w, h) = img.dimensions();
            let raw: Vec<f32> = img.into_raw().into_iter().map(|v| v as f32).collect();
            (raw, w, h)
        }
        other => {
            let img = other.into_luma8();
            let (w, h) = img.dimensions();
            let raw: Vec<f32> = img.into_raw().into_iter().map(|v| v as f32).collect();
            (raw, w, h)
        }
    };
    let geom = Geometry::identity(vec![width as usize, height as usize])?;
    // Image rows are y-major with x fastest, matching the buffer layout.
    Image::from_data(geom, 1, data)
}

fn write_png(path: &Path, img: &Image) -> Result<()> {
    if img.geometry().ndim() != 2 || img.channels() != 1 {
        return Err(RegError::Input(format!(
            "{}: only 2-D scalar images can be written as PNG",
            path.display()
        )));
    }
    let size = img.geometry().size();
    let (width, height) = (size[0] as u32, size[1] as u32);
    let mut out = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let v = img.get(y as usize * size[0] + x as usize, 0);
        *pixel = image::Luma([v.max(0.0).min(65535.0).round() as u16]);
    }
    out.save(path).map_err(|e| input_err(path, e))?;
    Ok(())
}

impl VolumeSource for FileVolumes {
    fn read_volume(&mut self, path: &Path, dim: usize) -> Result<Image> {
        if is_png_like(path) {
            if dim != 2 {
                return Err(RegError::Input(format!(
                    "{}: 2-D image formats need --dim 2",
                    path.display()
                )));
            }
            read_png(path)
        } else if is_nifti(path) {
            read_nifti(path, dim)
        } else {
            Err(RegError::Input(format!(
                "{}: unrecognized volume format",
                path.display()
            )))
        }
    }
}

impl VolumeSink for FileVolumes {
    fn write_volume(&mut self, path: &Path, image: &Image) -> Result<()> {
        if is_png_like(path) {
            write_png(path, image)
        } else {
            write_nifti(path, image)
        }
    }
}
