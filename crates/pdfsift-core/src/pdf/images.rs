use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use tracing::{debug, trace};

use super::PageImage;

/// Form XObjects may nest other forms; stop descending after this many levels.
const MAX_FORM_DEPTH: usize = 4;

/// Decode every supported image XObject reachable from a page's resources.
///
/// Each image keeps its position among all image XObjects on the page, so an
/// undecodable image still takes up its index.
pub(crate) fn page_images(doc: &Document, page_id: ObjectId) -> Vec<PageImage> {
    let mut images = Vec::new();
    let mut position = 0;
    if let Some(resources) = page_resources(doc, page_id) {
        collect_xobject_images(doc, &resources, 0, &mut position, &mut images);
    }
    images
}

fn collect_xobject_images(
    doc: &Document,
    resources: &Dictionary,
    depth: usize,
    position: &mut u32,
    images: &mut Vec<PageImage>,
) {
    let Ok(xobjects) = resources.get(b"XObject") else {
        return;
    };
    let Ok((_, Object::Dictionary(xobjects))) = doc.dereference(xobjects) else {
        return;
    };

    for (name, obj_ref) in xobjects.iter() {
        let Ok((_, Object::Stream(stream))) = doc.dereference(obj_ref) else {
            continue;
        };
        match subtype(&stream.dict) {
            Some(b"Image") => {
                *position += 1;
                match decode_image(doc, stream) {
                    Some(image) => images.push(PageImage {
                        index: *position,
                        image,
                    }),
                    None => debug!(
                        xobject = %String::from_utf8_lossy(name),
                        index = *position,
                        "skipping image in unsupported encoding"
                    ),
                }
            }
            Some(b"Form") if depth < MAX_FORM_DEPTH => {
                if let Some(inner) = dict_entry(doc, &stream.dict, b"Resources") {
                    collect_xobject_images(doc, &inner, depth + 1, position, images);
                }
            }
            _ => {}
        }
    }
}

fn subtype(dict: &Dictionary) -> Option<&[u8]> {
    dict.get(b"Subtype").ok()?.as_name().ok()
}

fn dict_entry(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<Dictionary> {
    let value = dict.get(key).ok()?;
    match doc.dereference(value) {
        Ok((_, Object::Dictionary(d))) => Some(d.clone()),
        _ => None,
    }
}

/// Resources dictionary for a page, following `Parent` links for inherited entries.
fn page_resources(doc: &Document, page_id: ObjectId) -> Option<Dictionary> {
    let mut node_id = page_id;
    // The page tree is shallow; the bound guards against reference cycles.
    for _ in 0..32 {
        let node = doc.get_object(node_id).ok()?.as_dict().ok()?;
        if let Some(resources) = dict_entry(doc, node, b"Resources") {
            return Some(resources);
        }
        match node.get(b"Parent") {
            Ok(Object::Reference(parent)) => node_id = *parent,
            _ => return None,
        }
    }
    None
}

fn filters(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|o| o.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_image(doc: &Document, stream: &Stream) -> Option<DynamicImage> {
    let dict = &stream.dict;
    let width = u32::try_from(dict.get(b"Width").ok()?.as_i64().ok()?).ok()?;
    let height = u32::try_from(dict.get(b"Height").ok()?.as_i64().ok()?).ok()?;
    if width == 0 || height == 0 {
        return None;
    }

    let filters = filters(dict);
    match filters.last().map(Vec::as_slice) {
        Some(b"DCTDecode") => {
            // Any filters before DCT wrap the JPEG bytes.
            let jpeg = if filters.len() > 1 {
                stream.decompressed_content().ok()?
            } else {
                stream.content.clone()
            };
            return image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg).ok();
        }
        Some(b"JPXDecode") | Some(b"CCITTFaxDecode") | Some(b"JBIG2Decode") => return None,
        _ => {}
    }

    let bits = dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .unwrap_or(8);
    if bits != 8 {
        trace!(bits, "unsupported bits per component");
        return None;
    }

    let data = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream.decompressed_content().ok()?
    };

    let components = color_components(doc, dict)?;
    raw_to_image(&data, width, height, components)
}

/// Number of 8-bit components per pixel for the supported colour spaces.
fn color_components(doc: &Document, dict: &Dictionary) -> Option<usize> {
    let cs = match dict.get(b"ColorSpace") {
        Ok(obj) => doc.dereference(obj).ok()?.1,
        Err(_) => return Some(3),
    };
    match cs {
        Object::Name(name) => device_components(name),
        Object::Array(items) => {
            let family = items.first()?.as_name().ok()?;
            if family == b"ICCBased" {
                let (_, profile) = doc.dereference(items.get(1)?).ok()?;
                let n = profile.as_stream().ok()?.dict.get(b"N").ok()?.as_i64().ok()?;
                usize::try_from(n).ok().filter(|n| matches!(n, 1 | 3 | 4))
            } else {
                device_components(family)
            }
        }
        _ => None,
    }
}

fn device_components(name: &[u8]) -> Option<usize> {
    match name {
        b"DeviceGray" | b"G" | b"CalGray" => Some(1),
        b"DeviceRGB" | b"RGB" | b"CalRGB" => Some(3),
        b"DeviceCMYK" | b"CMYK" => Some(4),
        _ => None,
    }
}

fn raw_to_image(data: &[u8], width: u32, height: u32, components: usize) -> Option<DynamicImage> {
    let Some(expected) = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(components))
    else {
        trace!(width, height, components, "image dimensions overflow");
        return None;
    };
    if data.len() < expected {
        trace!(len = data.len(), expected, "image stream too short");
        return None;
    }
    let data = &data[..expected];

    match components {
        1 => GrayImage::from_raw(width, height, data.to_vec()).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, data.to_vec()).map(DynamicImage::ImageRgb8),
        4 => {
            let rgb: Vec<u8> = data.chunks_exact(4).flat_map(cmyk_to_rgb).collect();
            RgbImage::from_raw(width, height, rgb).map(DynamicImage::ImageRgb8)
        }
        _ => None,
    }
}

fn cmyk_to_rgb(px: &[u8]) -> [u8; 3] {
    let k = 255 - px[3] as u16;
    let channel = |c: u8| ((255 - c as u16) * k / 255) as u8;
    [channel(px[0]), channel(px[1]), channel(px[2])]
}
