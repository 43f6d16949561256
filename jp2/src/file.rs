use log::{debug, info};
use std::error;

use crate::boxes::{FileTypeBox, HeaderSuperBox, JBox, SignatureBox};
use crate::family::{ContainerSource, ContainerTarget};
use crate::input_box::BoxReader;
use crate::locator::BoxLocator;
use crate::output_box::BoxWriter;
use crate::{
    box_type_name, JP2Error, BOX_TYPE_CONTIGUOUS_CODESTREAM, BOX_TYPE_FILE_TYPE, BOX_TYPE_HEADER,
    BOX_TYPE_SIGNATURE,
};

/// Reads the boxes of a JP2 file which precede its first codestream.
///
/// Works the same over a file and over a cache that is still filling up:
/// [`Jp2Source::open`] returns `Ok(false)` while required boxes are missing,
/// and picks up where it stopped when called again.
pub struct Jp2Source<'a> {
    source: ContainerSource<'a>,
    reader: BoxReader<'a>,
    next: Option<BoxLocator>,
    signature_box: Option<SignatureBox>,
    file_type_box: Option<FileTypeBox>,
    header_box: Option<HeaderSuperBox>,
    codestream: Option<BoxLocator>,
}

impl<'a> Jp2Source<'a> {
    pub fn new(source: ContainerSource<'a>) -> Jp2Source<'a> {
        Jp2Source {
            source,
            reader: BoxReader::new(),
            next: Some(BoxLocator::new()),
            signature_box: None,
            file_type_box: None,
            header_box: None,
            codestream: None,
        }
    }

    /// Reads top-level boxes up to the first contiguous codestream box.
    pub fn open(&mut self) -> Result<bool, Box<dyn error::Error>> {
        while self.codestream.is_none() {
            if !self.reader.is_open() {
                let locator = match self.next {
                    Some(locator) => locator,
                    None => return Err(self.missing().into()),
                };
                if !self.reader.open(&self.source, locator)? {
                    if self.source.is_top_level_complete() {
                        return Err(self.missing().into());
                    }
                    return Ok(false);
                }
            }
            if !self.read_current()? {
                return Ok(false);
            }
            if self.codestream.is_none() {
                self.next = self.reader.sibling_locator();
                self.reader.close();
            }
        }
        self.reader.close();
        Ok(true)
    }

    fn missing(&self) -> JP2Error {
        let box_type = if self.signature_box.is_none() {
            BOX_TYPE_SIGNATURE
        } else if self.file_type_box.is_none() {
            BOX_TYPE_FILE_TYPE
        } else if self.header_box.is_none() {
            BOX_TYPE_HEADER
        } else {
            BOX_TYPE_CONTIGUOUS_CODESTREAM
        };
        JP2Error::BoxMissing { box_type }
    }

    fn read_current(&mut self) -> Result<bool, Box<dyn error::Error>> {
        let box_type = self.reader.box_type();
        let offset = self.reader.locator().file_pos().unwrap_or(0);

        // The Signature box comes first and the File Type box right after.
        if self.signature_box.is_none() {
            if box_type != BOX_TYPE_SIGNATURE {
                return Err(JP2Error::BoxUnexpected { box_type, offset }.into());
            }
            let mut signature_box = SignatureBox::default();
            if !signature_box.decode(&mut self.reader)? {
                return Ok(false);
            }
            info!("SignatureBox finish at {:?}", offset);
            self.signature_box = Some(signature_box);
            return Ok(true);
        }
        if self.file_type_box.is_none() {
            if box_type != BOX_TYPE_FILE_TYPE {
                return Err(JP2Error::BoxUnexpected { box_type, offset }.into());
            }
            let mut file_type_box = FileTypeBox::default();
            if !file_type_box.decode(&mut self.reader)? {
                return Ok(false);
            }
            info!("FileTypeBox finish at {:?}", offset);
            self.file_type_box = Some(file_type_box);
            return Ok(true);
        }

        match box_type {
            BOX_TYPE_SIGNATURE | BOX_TYPE_FILE_TYPE => {
                return Err(JP2Error::BoxDuplicate { box_type, offset }.into());
            }
            BOX_TYPE_HEADER => {
                if self.header_box.is_some() {
                    return Err(JP2Error::BoxDuplicate { box_type, offset }.into());
                }
                // A retry starts again from the first sub-box.
                self.reader.seek(0)?;
                let mut header_box = HeaderSuperBox::default();
                if !header_box.decode(&mut self.reader)? {
                    return Ok(false);
                }
                info!("HeaderSuperBox finish at {:?}", offset);
                self.header_box = Some(header_box);
            }
            BOX_TYPE_CONTIGUOUS_CODESTREAM => {
                // Contiguous Codestream boxes may be found anywhere in the
                // file except before the JP2 Header box.
                if self.header_box.is_none() {
                    return Err(JP2Error::BoxMissing {
                        box_type: BOX_TYPE_HEADER,
                    }
                    .into());
                }
                info!("ContiguousCodestreamBox start at {:?}", offset);
                self.codestream = Some(self.reader.locator());
            }
            _ => debug!("Skipping {} box at {}", box_type_name(&box_type), offset),
        }
        Ok(true)
    }

    pub fn source(&self) -> &ContainerSource<'a> {
        &self.source
    }

    pub fn signature_box(&self) -> Option<&SignatureBox> {
        self.signature_box.as_ref()
    }

    pub fn file_type_box(&self) -> Option<&FileTypeBox> {
        self.file_type_box.as_ref()
    }

    pub fn header_box(&self) -> Option<&HeaderSuperBox> {
        self.header_box.as_ref()
    }

    /// Locator of the first contiguous codestream box, once found.
    pub fn codestream_locator(&self) -> Option<BoxLocator> {
        self.codestream
    }

    /// Opens the first contiguous codestream box on `reader`, ready to be
    /// handed to a codestream as its source.
    pub fn open_codestream(&self, reader: &mut BoxReader<'a>) -> Result<bool, Box<dyn error::Error>> {
        let locator = self.codestream.ok_or(JP2Error::BoxMissing {
            box_type: BOX_TYPE_CONTIGUOUS_CODESTREAM,
        })?;
        reader.open(&self.source, locator)
    }
}

/// Writes the boxes of a JP2 file ahead of its codestream.
pub struct Jp2Target<'a> {
    target: ContainerTarget<'a>,
    header_written: bool,
}

impl<'a> Jp2Target<'a> {
    pub fn new(target: ContainerTarget<'a>) -> Jp2Target<'a> {
        Jp2Target {
            target,
            header_written: false,
        }
    }

    /// Writes the Signature, File Type and JP2 Header boxes.
    pub fn write_header(&mut self, header_box: &HeaderSuperBox) -> Result<(), Box<dyn error::Error>> {
        if self.header_written {
            return Err(JP2Error::BoxDuplicate {
                box_type: BOX_TYPE_HEADER,
                offset: self.target.bytes_written(),
            }
            .into());
        }
        let leaves = [
            (BOX_TYPE_SIGNATURE, SignatureBox::default().encode()),
            (BOX_TYPE_FILE_TYPE, FileTypeBox::jp2().encode()),
        ];
        for (box_type, contents) in leaves {
            let mut writer = BoxWriter::open(&self.target, box_type, false)?;
            if !writer.write(&contents) || !writer.close() {
                return Err(self.refused(box_type));
            }
        }

        let mut header = BoxWriter::open(&self.target, BOX_TYPE_HEADER, false)?;
        header_box.write(&mut header)?;
        if !header.close() {
            return Err(self.refused(BOX_TYPE_HEADER));
        }
        self.header_written = true;
        info!("JP2 header written, {} bytes", self.target.bytes_written());
        Ok(())
    }

    fn refused(&self, box_type: crate::BoxType) -> Box<dyn error::Error> {
        JP2Error::BoxMalformed {
            box_type,
            offset: self.target.bytes_written(),
            reason: "target refused the box".to_string(),
        }
        .into()
    }

    /// Opens the contiguous codestream box. A `rubber` box is written
    /// straight through and runs to the end of the file; otherwise the box
    /// is collected and written when closed.
    pub fn open_codestream(&mut self, rubber: bool) -> Result<BoxWriter<'a>, Box<dyn error::Error>> {
        if !self.header_written {
            return Err(JP2Error::BoxMissing {
                box_type: BOX_TYPE_HEADER,
            }
            .into());
        }
        BoxWriter::open(&self.target, BOX_TYPE_CONTIGUOUS_CODESTREAM, rubber)
    }

    pub fn target(&self) -> &ContainerTarget<'a> {
        &self.target
    }

    pub fn close(&mut self) -> bool {
        self.target.close()
    }
}
