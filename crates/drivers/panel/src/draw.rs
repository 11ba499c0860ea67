//! Overlay drawing on top of the flushed image.
//!
//! Rasterisation is left to `embedded-graphics`; the panel only has to
//! accept pixels and solid fills.

use core::convert::Infallible;

use embedded_graphics::mono_font::ascii::FONT_6X10;
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::raw::RawU16;
use embedded_graphics::pixelcolor::Rgb565;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Circle, Line, PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Baseline, Text};

use crate::link::PanelLink;
use crate::panel::{Panel, Rect};

fn color(native: u16) -> Rgb565 {
    Rgb565::from(RawU16::new(native))
}

impl<L: PanelLink> DrawTarget for Panel<L> {
    type Color = Rgb565;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let width = i32::from(self.width());
        let height = i32::from(self.height());
        for Pixel(point, c) in pixels {
            if point.x >= 0 && point.x < width && point.y >= 0 && point.y < height {
                self.push_pixel(point.x as u16, point.y as u16, c.into_storage());
            }
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, c: Self::Color) -> Result<(), Self::Error> {
        let clipped = area.intersection(&self.bounding_box());
        if clipped.size.width == 0 || clipped.size.height == 0 {
            return Ok(());
        }
        let rect = Rect::new(
            clipped.top_left.x as u16,
            clipped.top_left.y as u16,
            clipped.size.width as u16,
            clipped.size.height as u16,
        );
        self.fill_rect(rect, c.into_storage());
        Ok(())
    }
}

impl<L: PanelLink> OriginDimensions for Panel<L> {
    fn size(&self) -> Size {
        Size::new(u32::from(self.width()), u32::from(self.height()))
    }
}

impl<L: PanelLink> Panel<L> {
    pub fn draw_line(&mut self, from: (i32, i32), to: (i32, i32), native: u16) {
        let _ = Line::new(Point::new(from.0, from.1), Point::new(to.0, to.1))
            .into_styled(PrimitiveStyle::with_stroke(color(native), 1))
            .draw(self);
    }

    /// One-pixel outline of `area`.
    pub fn draw_rect(&mut self, area: Rect, native: u16) {
        let _ = rectangle(area)
            .into_styled(PrimitiveStyle::with_stroke(color(native), 1))
            .draw(self);
    }

    pub fn draw_circle(&mut self, center: (i32, i32), radius: u32, native: u16) {
        let _ = Circle::with_center(Point::new(center.0, center.1), radius * 2 + 1)
            .into_styled(PrimitiveStyle::with_stroke(color(native), 1))
            .draw(self);
    }

    pub fn fill_circle(&mut self, center: (i32, i32), radius: u32, native: u16) {
        let _ = Circle::with_center(Point::new(center.0, center.1), radius * 2 + 1)
            .into_styled(PrimitiveStyle::with_fill(color(native)))
            .draw(self);
    }

    /// Width in pixels `text` would occupy with the overlay font.
    pub fn text_width(text: &str) -> u32 {
        let glyphs = text.chars().count() as u32;
        glyphs * (FONT_6X10.character_size.width + FONT_6X10.character_spacing)
    }

    pub fn text_height() -> u32 {
        FONT_6X10.character_size.height
    }

    /// Draw `text` with its top-left corner at `origin`.
    pub fn draw_text(&mut self, origin: (i32, i32), text: &str, native: u16) {
        let style = MonoTextStyle::new(&FONT_6X10, color(native));
        let _ = Text::with_baseline(text, Point::new(origin.0, origin.1), style, Baseline::Top)
            .draw(self);
    }
}

fn rectangle(area: Rect) -> Rectangle {
    Rectangle::new(
        Point::new(i32::from(area.x), i32::from(area.y)),
        Size::new(u32::from(area.width), u32::from(area.height)),
    )
}
