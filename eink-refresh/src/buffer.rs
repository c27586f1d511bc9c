use alloc::vec::Vec;

use embedded_graphics::{
    pixelcolor::{Gray8, GrayColor},
    prelude::{Dimensions, DrawTarget, Point, PointsIter, Size},
    primitives::Rectangle,
    Pixel,
};

use crate::{config::EinkConfig, Error};

/// A frame buffer of 8bpp grayscale pixels, in the layout [crate::EinkUpdate::update_image]
/// expects.
pub struct GrayBuffer {
    size: Size,
    data: Vec<u8>,
}

impl GrayBuffer {
    /// Creates a new [GrayBuffer] with all pixels white.
    ///
    /// ```
    /// use embedded_graphics::prelude::Size;
    /// use eink_refresh::buffer::GrayBuffer;
    ///
    /// let buffer = GrayBuffer::new(Size::new(8, 8)).unwrap();
    /// assert_eq!(buffer.data().len(), 64);
    /// ```
    pub fn new(dimensions: Size) -> Result<Self, Error> {
        let len = dimensions.width as usize * dimensions.height as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory)?;
        data.resize(len, Gray8::WHITE.luma());
        Ok(Self {
            size: dimensions,
            data,
        })
    }

    /// Creates a buffer covering the whole panel.
    pub fn for_panel(config: &EinkConfig) -> Result<Self, Error> {
        Self::new(Size::new(config.width, config.height))
    }

    /// Access the pixel data, one byte per pixel in row-major order.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn index_of(&self, point: Point) -> Option<usize> {
        if point.x < 0
            || point.x >= self.size.width as i32
            || point.y < 0
            || point.y >= self.size.height as i32
        {
            return None;
        }
        Some(point.x as usize + point.y as usize * self.size.width as usize)
    }
}

impl Dimensions for GrayBuffer {
    fn bounding_box(&self) -> Rectangle {
        Rectangle::new(Point::zero(), self.size)
    }
}

impl DrawTarget for GrayBuffer {
    type Color = Gray8;

    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels.into_iter() {
            // Skip out-of-bounds pixels
            if let Some(index) = self.index_of(point) {
                self.data[index] = color.luma();
            }
        }
        Ok(())
    }

    fn fill_contiguous<I>(&mut self, area: &Rectangle, colors: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Self::Color>,
    {
        let drawable_area = self.bounding_box().intersection(area);
        if drawable_area.is_zero_sized() {
            return Ok(()); // Nothing to fill
        }

        let mut colors_iter = colors.into_iter();
        for point in area.points() {
            // Exit if there are no more colors to apply.
            let Some(color) = colors_iter.next() else {
                return Ok(());
            };
            if let Some(index) = self.index_of(point) {
                self.data[index] = color.luma();
            }
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        let drawable_area = self.bounding_box().intersection(area);
        if drawable_area.is_zero_sized() {
            return Ok(()); // Nothing to fill
        }

        let width = self.size.width as usize;
        let x_start = drawable_area.top_left.x as usize;
        let x_end = x_start + drawable_area.size.width as usize;
        let y_start = drawable_area.top_left.y as usize;
        for y in y_start..y_start + drawable_area.size.height as usize {
            self.data[y * width + x_start..y * width + x_end].fill(color.luma());
        }
        Ok(())
    }
}
