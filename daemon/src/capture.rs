/// Screen-region capture using GDI `BitBlt`.
///
/// GDI copies straight from the desktop DC, so it works with any windowed or
/// borderless game without hooking the game process.
///
/// On non-Windows platforms the public API compiles but `grab` returns an error.
use anyhow::Result;
use image::RgbImage;

use crate::config::CaptureRegion;

/// Something that can produce the pixels of a screen region.
pub trait FrameSource: Send {
    fn grab(&mut self, region: &CaptureRegion) -> Result<RgbImage>;
}

/// Captures from the desktop.
#[derive(Debug, Default)]
pub struct ScreenCapture;

/// Boxed desktop capture for the vision sensor.
pub fn screen() -> Box<dyn FrameSource> {
    Box::new(ScreenCapture)
}

/// Converts tightly-packed top-down BGRA rows into an RGB image.
#[cfg_attr(not(windows), allow(dead_code))]
fn bgra_to_rgb(bgra: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let rgb: Vec<u8> = bgra
        .chunks_exact(4)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    RgbImage::from_raw(width, height, rgb)
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use anyhow::{bail, Context, Result};
    use image::RgbImage;
    use windows::Win32::Graphics::Gdi::{
        BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC,
        GetDIBits, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB,
        DIB_RGB_COLORS, HBITMAP, HDC, HGDIOBJ, SRCCOPY,
    };

    use crate::config::CaptureRegion;

    /// RAII guard releasing the GDI objects in reverse order of creation.
    struct GdiGuard {
        screen_dc: HDC,
        mem_dc: HDC,
        bitmap: HBITMAP,
        previous: HGDIOBJ,
    }

    impl Drop for GdiGuard {
        fn drop(&mut self) {
            unsafe {
                SelectObject(self.mem_dc, self.previous);
                let _ = DeleteObject(self.bitmap);
                let _ = DeleteDC(self.mem_dc);
                ReleaseDC(None, self.screen_dc);
            }
        }
    }

    pub fn grab(region: &CaptureRegion) -> Result<RgbImage> {
        let width = i32::try_from(region.width).context("Capture width out of range")?;
        let height = i32::try_from(region.height).context("Capture height out of range")?;
        if width == 0 || height == 0 {
            bail!("Capture region is empty");
        }

        let mut bgra = vec![0u8; region.width as usize * region.height as usize * 4];
        unsafe {
            let screen_dc = GetDC(None);
            if screen_dc.is_invalid() {
                bail!("GetDC failed");
            }
            let mem_dc = CreateCompatibleDC(screen_dc);
            let bitmap = CreateCompatibleBitmap(screen_dc, width, height);
            let previous = SelectObject(mem_dc, bitmap);
            let guard = GdiGuard { screen_dc, mem_dc, bitmap, previous };

            BitBlt(
                guard.mem_dc,
                0,
                0,
                width,
                height,
                guard.screen_dc,
                region.left,
                region.top,
                SRCCOPY,
            )
            .context("BitBlt failed")?;

            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: width,
                    // Negative height: top-down rows.
                    biHeight: -height,
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let lines = GetDIBits(
                guard.mem_dc,
                guard.bitmap,
                0,
                region.height,
                Some(bgra.as_mut_ptr().cast()),
                &mut info,
                DIB_RGB_COLORS,
            );
            if lines != height {
                bail!("GetDIBits copied {lines} of {height} rows");
            }
        }

        super::bgra_to_rgb(&bgra, region.width, region.height)
            .context("Captured buffer has unexpected size")
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

impl FrameSource for ScreenCapture {
    fn grab(&mut self, region: &CaptureRegion) -> Result<RgbImage> {
        #[cfg(windows)]
        {
            imp::grab(region)
        }

        #[cfg(not(windows))]
        {
            let _ = region;
            anyhow::bail!("Screen capture (GDI) is only supported on Windows")
        }
    }
}
