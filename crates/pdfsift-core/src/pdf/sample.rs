//! Small PDF builder for tests.

use lopdf::content::{Content, Operation};
use lopdf::encryption;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};

use crate::error::{CoreError, Result};

/// Password padding string from the standard security handler.
const PASSWORD_PAD: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08,
    0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

/// An uncompressed 8-bit RGB picture to embed as an image XObject.
#[derive(Debug, Clone)]
pub struct SampleImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl SampleImage {
    pub fn solid(width: u32, height: u32, color: [u8; 3]) -> Self {
        let rgb = color
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self { width, height, rgb }
    }
}

#[derive(Debug, Clone)]
enum SampleXObject {
    Image(SampleImage),
    /// Image wrapped in a Form XObject with its own resources.
    Form(SampleImage),
    /// JPEG 2000 stream the extractor cannot decode.
    Jpx,
}

#[derive(Debug, Clone, Default)]
pub struct SamplePage {
    lines: Vec<(f32, f32, String)>,
    xobjects: Vec<SampleXObject>,
}

impl SamplePage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw `text` with its baseline starting at `(x, y)`.
    pub fn line(mut self, x: f32, y: f32, text: &str) -> Self {
        self.lines.push((x, y, text.to_string()));
        self
    }

    pub fn image(mut self, image: SampleImage) -> Self {
        self.xobjects.push(SampleXObject::Image(image));
        self
    }

    /// Draw `image` through a Form XObject.
    pub fn form_image(mut self, image: SampleImage) -> Self {
        self.xobjects.push(SampleXObject::Form(image));
        self
    }

    /// Add an image XObject in an encoding that cannot be decoded.
    pub fn jpx_placeholder(mut self) -> Self {
        self.xobjects.push(SampleXObject::Jpx);
        self
    }
}

/// Build a PDF with one Letter-sized page per entry.
pub fn build_pdf(pages: &[SamplePage]) -> Result<Vec<u8>> {
    save(build_document(pages, false)?)
}

/// Like [`build_pdf`], but every resource lives on the page-tree root and
/// pages carry no `Resources` entry of their own.
pub fn build_pdf_with_inherited_resources(pages: &[SamplePage]) -> Result<Vec<u8>> {
    save(build_document(pages, true)?)
}

/// A structurally valid PDF whose page tree has no kids.
pub fn empty_pdf() -> Result<Vec<u8>> {
    save(build_document(&[], false)?)
}

/// Build a PDF encrypted with the RC4 standard security handler (revision 2).
/// An empty `user_password` produces a file any reader can open.
pub fn encrypted_pdf(pages: &[SamplePage], user_password: &str) -> Result<Vec<u8>> {
    let mut doc = build_document(pages, false)?;

    let file_id = Object::String(b"pdfsift-sample-1".to_vec(), StringFormat::Hexadecimal);
    doc.trailer.set("ID", vec![file_id.clone(), file_id]);

    let encrypt_id = doc.add_object(dictionary! {
        "Filter" => "Standard",
        "V" => Object::Integer(1),
        "R" => Object::Integer(2),
        "Length" => Object::Integer(40),
        "P" => Object::Integer(-4),
        "O" => Object::String(vec![0x5A; 32], StringFormat::Hexadecimal),
        "CF" => dictionary! { "StdCF" => dictionary! { "CFM" => "V2" } },
    });
    doc.trailer.set("Encrypt", encrypt_id);

    let key = encryption::get_encryption_key(&doc, user_password, false)
        .map_err(|e| CoreError::Pdf(format!("derive sample key: {e}")))?;

    for (&id, object) in doc.objects.iter_mut() {
        if id == encrypt_id {
            continue;
        }
        // RC4 is symmetric, so decrypting plaintext encrypts it.
        let Ok(sealed) = encryption::decrypt_object(&key, id, &*object, false) else {
            continue;
        };
        match object {
            Object::Stream(stream) => stream.set_content(sealed),
            Object::String(content, _) => *content = sealed,
            _ => {}
        }
    }

    let check = rc4(&key, &PASSWORD_PAD);
    doc.get_object_mut(encrypt_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| CoreError::Pdf(format!("encrypt dictionary: {e}")))?
        .set("U", Object::String(check, StringFormat::Hexadecimal));

    save(doc)
}

fn build_document(pages: &[SamplePage], inherit_resources: bool) -> Result<Document> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });

    let mut shared_xobjects = Dictionary::new();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for (page_index, page) in pages.iter().enumerate() {
        let mut operations = Vec::new();
        let mut xobjects = Dictionary::new();

        for (i, xobject) in page.xobjects.iter().enumerate() {
            let name = format!("X{}_{}", page_index + 1, i + 1);
            let id = add_xobject(&mut doc, xobject)?;
            xobjects.set(name.clone(), id);

            let offset = 50.0 + 110.0 * i as f32;
            operations.push(Operation::new("q", vec![]));
            operations.push(Operation::new(
                "cm",
                [100.0, 0.0, 0.0, 100.0, offset, 50.0]
                    .into_iter()
                    .map(Object::Real)
                    .collect(),
            ));
            operations.push(Operation::new("Do", vec![Object::Name(name.into_bytes())]));
            operations.push(Operation::new("Q", vec![]));
        }

        for (x, y, text) in &page.lines {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new(
                "Tf",
                vec![Object::Name(b"F1".to_vec()), Object::Integer(12)],
            ));
            operations.push(Operation::new("Td", vec![Object::Real(*x), Object::Real(*y)]));
            operations.push(Operation::new(
                "Tj",
                vec![Object::String(text.as_bytes().to_vec(), StringFormat::Literal)],
            ));
            operations.push(Operation::new("ET", vec![]));
        }

        let content_id = doc.add_object(Stream::new(dictionary! {}, encode(operations)?));

        let mut page_dict = dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => [0, 0, 612, 792].into_iter().map(Object::Integer).collect::<Vec<_>>(),
        };
        if inherit_resources {
            for (name, id) in xobjects.into_iter() {
                shared_xobjects.set(name, id);
            }
        } else {
            page_dict.set("Resources", resources(font_id, xobjects));
        }
        kids.push(doc.add_object(page_dict).into());
    }

    let count = kids.len() as i64;
    let mut root = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(count),
    };
    if inherit_resources {
        let resources_id = doc.add_object(resources(font_id, shared_xobjects));
        root.set("Resources", resources_id);
    }
    doc.objects.insert(pages_id, Object::Dictionary(root));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    Ok(doc)
}

fn resources(font_id: ObjectId, xobjects: Dictionary) -> Dictionary {
    let mut resources = dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    };
    if !xobjects.is_empty() {
        resources.set("XObject", xobjects);
    }
    resources
}

fn add_xobject(doc: &mut Document, xobject: &SampleXObject) -> Result<ObjectId> {
    match xobject {
        SampleXObject::Image(img) => Ok(doc.add_object(image_stream(img))),
        SampleXObject::Jpx => Ok(doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => Object::Integer(1),
                "Height" => Object::Integer(1),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => Object::Integer(8),
                "Filter" => "JPXDecode",
            },
            vec![0, 0, 0],
        ))),
        SampleXObject::Form(img) => {
            let image_id = doc.add_object(image_stream(img));
            let content = encode(vec![Operation::new("Do", vec![Object::Name(b"Inner".to_vec())])])?;
            Ok(doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Form",
                    "BBox" => [0, 0, 1, 1].into_iter().map(Object::Integer).collect::<Vec<_>>(),
                    "Resources" => dictionary! {
                        "XObject" => dictionary! { "Inner" => image_id },
                    },
                },
                content,
            )))
        }
    }
}

fn image_stream(img: &SampleImage) -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => Object::Integer(img.width as i64),
            "Height" => Object::Integer(img.height as i64),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => Object::Integer(8),
        },
        img.rgb.clone(),
    )
}

fn encode(operations: Vec<Operation>) -> Result<Vec<u8>> {
    Content { operations }
        .encode()
        .map_err(|e| CoreError::Pdf(format!("encode content: {e}")))
}

fn save(mut doc: Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    doc.save_to(&mut buf)
        .map_err(|e| CoreError::Pdf(format!("write sample pdf: {e}")))?;
    Ok(buf)
}

fn rc4(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut state: [u8; 256] = std::array::from_fn(|i| i as u8);
    let mut j = 0u8;
    for i in 0..256 {
        j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
        state.swap(i, j as usize);
    }

    let (mut i, mut j) = (0u8, 0u8);
    data.iter()
        .map(|byte| {
            i = i.wrapping_add(1);
            j = j.wrapping_add(state[i as usize]);
            state.swap(i as usize, j as usize);
            byte ^ state[state[i as usize].wrapping_add(state[j as usize]) as usize]
        })
        .collect()
}

/// One page per string, each drawn as a single line.
pub fn text_pdf(pages: &[&str]) -> Result<Vec<u8>> {
    let pages: Vec<SamplePage> = pages
        .iter()
        .map(|text| SamplePage::new().line(72.0, 720.0, text))
        .collect();
    build_pdf(&pages)
}
