// SPDX-License-Identifier: MPL-2.0

//! Software scaling of planar YUV 4:2:0 frames onto XRGB8888 canvases.
//!
//! Each plane is resized on its own with `fast_image_resize`, then the
//! scaled planes are converted to packed RGB with BT.601 limited range
//! coefficients, one row per rayon task.

use cosmic_video_out_config::ScalingAlgorithm;
use eyre::eyre;
use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{PixelType, ResizeOptions, Resizer};
use rayon::prelude::*;

/// Byte ranges of the Y, U and V planes inside an I420 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    pub chroma_width: u32,
    pub chroma_height: u32,
}

impl PlaneLayout {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            chroma_width: (width / 2).max(1),
            chroma_height: (height / 2).max(1),
        }
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn chroma_len(&self) -> usize {
        self.chroma_width as usize * self.chroma_height as usize
    }

    /// Split a frame into its planes.
    ///
    /// # Errors
    ///
    /// Fails if `data` is too short for the layout.
    pub fn split<'a>(&self, data: &'a [u8]) -> eyre::Result<[&'a [u8]; 3]> {
        let luma = self.luma_len();
        let chroma = self.chroma_len();
        if data.len() < luma + 2 * chroma {
            return Err(eyre!(
                "frame of {} bytes too short for {}x{} I420",
                data.len(),
                self.width,
                self.height
            ));
        }

        Ok([
            &data[..luma],
            &data[luma..luma + chroma],
            &data[luma + chroma..luma + 2 * chroma],
        ])
    }
}

/// Per-surface software scaler, reusing its plane buffers between frames.
pub struct SoftwareScaler {
    resizer: Resizer,
    algorithm: ScalingAlgorithm,
    planes: Option<[Image<'static>; 3]>,
}

impl std::fmt::Debug for SoftwareScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareScaler")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SoftwareScaler {
    #[must_use]
    pub fn new(algorithm: ScalingAlgorithm) -> Self {
        Self {
            resizer: Resizer::new(),
            algorithm,
            planes: None,
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> ScalingAlgorithm {
        self.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: ScalingAlgorithm) {
        if self.algorithm != algorithm {
            tracing::debug!(?algorithm, "software scaling algorithm changed");
            self.algorithm = algorithm;
        }
    }

    /// Scale an I420 frame to `dst_width` x `dst_height` and write it to
    /// `canvas` as XRGB8888, resizing `canvas` to fit.
    ///
    /// # Errors
    ///
    /// Fails on empty sizes or a frame too short for its dimensions.
    pub fn scale_to_xrgb(
        &mut self,
        frame: &[u8],
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
        canvas: &mut Vec<u8>,
    ) -> eyre::Result<()> {
        if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
            return Err(eyre!(
                "cannot scale {src_width}x{src_height} to {dst_width}x{dst_height}"
            ));
        }

        let src = PlaneLayout::new(src_width, src_height);
        let src_planes = src.split(frame)?;
        let dst = PlaneLayout::new(dst_width, dst_height);
        canvas.resize(dst_width as usize * dst_height as usize * 4, 0);

        if src == dst {
            i420_to_xrgb8888(src_planes, &dst, canvas);
            return Ok(());
        }

        let sizes = [
            (src.width, src.height, dst.width, dst.height),
            (src.chroma_width, src.chroma_height, dst.chroma_width, dst.chroma_height),
            (src.chroma_width, src.chroma_height, dst.chroma_width, dst.chroma_height),
        ];

        let Self {
            resizer,
            algorithm,
            planes,
        } = self;

        let stale = planes.as_ref().is_none_or(|planes| {
            planes[0].width() != dst.width
                || planes[0].height() != dst.height
                || planes[1].width() != dst.chroma_width
                || planes[1].height() != dst.chroma_height
        });
        if stale {
            *planes = Some(sizes.map(|(_, _, w, h)| Image::new(w, h, PixelType::U8)));
        }

        let options = ResizeOptions::new().resize_alg((*algorithm).into());
        let Some(scaled) = planes.as_mut() else {
            return Err(eyre!("scaler planes missing"));
        };

        for ((plane, (w, h, _, _)), dst_plane) in
            src_planes.iter().zip(sizes).zip(scaled.iter_mut())
        {
            let src_image = ImageRef::new(w, h, plane, PixelType::U8)?;
            resizer.resize(&src_image, dst_plane, &options)?;
        }

        let [y, u, v] = scaled;
        i420_to_xrgb8888([y.buffer(), u.buffer(), v.buffer()], &dst, canvas);
        Ok(())
    }
}

/// Convert I420 planes to a packed XRGB8888 canvas of the same size.
pub fn i420_to_xrgb8888(planes: [&[u8]; 3], layout: &PlaneLayout, canvas: &mut [u8]) {
    let [y_plane, u_plane, v_plane] = planes;
    let width = layout.width as usize;
    let chroma_width = layout.chroma_width as usize;
    let chroma_max_col = chroma_width - 1;
    let chroma_max_row = layout.chroma_height as usize - 1;

    canvas
        .par_chunks_exact_mut(width * 4)
        .enumerate()
        .for_each(|(row, out)| {
            let luma = &y_plane[row * width..(row + 1) * width];
            let chroma_row = (row / 2).min(chroma_max_row) * chroma_width;

            for (col, px) in out.chunks_exact_mut(4).enumerate() {
                let chroma = chroma_row + (col / 2).min(chroma_max_col);
                let [r, g, b] = yuv_to_rgb(luma[col], u_plane[chroma], v_plane[chroma]);
                px.copy_from_slice(&[b, g, r, 0xff]);
            }
        });
}

/// BT.601 limited range YUV to RGB, integer arithmetic.
#[must_use]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// BT.601 limited range RGB to YUV, the inverse of [`yuv_to_rgb`].
#[must_use]
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    [y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_store::i420_len;

    fn solid(width: u32, height: u32, yuv: [u8; 3]) -> Vec<u8> {
        let layout = PlaneLayout::new(width, height);
        let mut frame = vec![yuv[0]; layout.luma_len()];
        frame.extend(std::iter::repeat_n(yuv[1], layout.chroma_len()));
        frame.extend(std::iter::repeat_n(yuv[2], layout.chroma_len()));
        frame
    }

    #[test]
    fn test_reference_colours() {
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(128, 128, 128), [130, 130, 130]);

        let [r, g, b] = yuv_to_rgb(81, 90, 240);
        assert!(r > 240 && g < 10 && b < 10, "red came out as {r},{g},{b}");
    }

    #[test]
    fn test_rgb_roundtrip_close() {
        for rgb in [[235, 16, 16], [16, 235, 16], [16, 16, 235], [128, 64, 200]] {
            let [y, u, v] = rgb_to_yuv(rgb[0], rgb[1], rgb[2]);
            let back = yuv_to_rgb(y, u, v);
            for (a, b) in rgb.iter().zip(back) {
                assert!(a.abs_diff(b) <= 3, "{rgb:?} came back as {back:?}");
            }
        }
    }

    #[test]
    fn test_same_size_conversion() {
        let frame = solid(4, 4, [235, 128, 128]);
        let mut canvas = Vec::new();
        let mut scaler = SoftwareScaler::new(ScalingAlgorithm::Bilinear);
        scaler.scale_to_xrgb(&frame, 4, 4, 4, 4, &mut canvas).unwrap();

        assert_eq!(canvas.len(), 4 * 4 * 4);
        for px in canvas.chunks_exact(4) {
            assert_eq!(px, &[255, 255, 255, 255]);
        }
    }

    #[test]
    fn test_upscale_keeps_flat_colour() {
        let frame = solid(8, 6, [128, 128, 128]);
        let mut canvas = Vec::new();

        for algorithm in [
            ScalingAlgorithm::Nearest,
            ScalingAlgorithm::Tiles,
            ScalingAlgorithm::Bilinear,
            ScalingAlgorithm::Hyper,
        ] {
            let mut scaler = SoftwareScaler::new(algorithm);
            scaler.scale_to_xrgb(&frame, 8, 6, 24, 18, &mut canvas).unwrap();
            assert_eq!(canvas.len(), 24 * 18 * 4);
            for px in canvas.chunks_exact(4) {
                for channel in &px[..3] {
                    assert!(channel.abs_diff(130) <= 3, "{algorithm:?} produced {px:?}");
                }
            }
        }
    }

    #[test]
    fn test_downscale_then_resize_again() {
        let frame = solid(352, 288, [16, 128, 128]);
        let mut canvas = Vec::new();
        let mut scaler = SoftwareScaler::new(ScalingAlgorithm::Nearest);

        scaler.scale_to_xrgb(&frame, 352, 288, 117, 96, &mut canvas).unwrap();
        assert_eq!(canvas.len(), 117 * 96 * 4);

        scaler.scale_to_xrgb(&frame, 352, 288, 640, 480, &mut canvas).unwrap();
        assert_eq!(canvas.len(), 640 * 480 * 4);
        assert!(canvas.chunks_exact(4).all(|px| px[..3] == [0, 0, 0]));
    }

    #[test]
    fn test_smallest_frames_fit_their_planes() {
        for (w, h) in [(2, 2), (2, 3), (3, 2), (3, 3), (5, 7)] {
            let frame = vec![0; i420_len(w, h)];
            assert!(PlaneLayout::new(w, h).split(&frame).is_ok(), "{w}x{h}");
        }
    }

    #[test]
    fn test_short_frame_rejected() {
        let mut canvas = Vec::new();
        let mut scaler = SoftwareScaler::new(ScalingAlgorithm::Bilinear);
        let short = vec![0; i420_len(16, 16) - 1];
        assert!(scaler.scale_to_xrgb(&short, 16, 16, 8, 8, &mut canvas).is_err());
        assert!(scaler.scale_to_xrgb(&short, 0, 16, 8, 8, &mut canvas).is_err());
    }
}
