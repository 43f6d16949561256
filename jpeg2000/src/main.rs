use clap::Parser;
use std::error;
use std::error::Error;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;

use jp2::{box_type_name, is_super_box, BoxReader, ContainerSource, Jp2Source};
use jpc::{Codestream, Coords, FileSource, ViewRestrictions};

#[derive(Debug)]
enum JP2000Error {
    DecodingContainer { error: String },
    DecodingCodestream { error: String },
    UnsupportedExtension { extension: String },
}

impl error::Error for JP2000Error {}
impl fmt::Display for JP2000Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DecodingContainer { error } => {
                write!(f, "error decoding jp2 container {}", error)
            }
            Self::DecodingCodestream { error } => {
                write!(f, "error decoding jpc codestream {}", error)
            }
            Self::UnsupportedExtension { extension } => {
                write!(f, "unsupported extension {}", extension)
            }
        }
    }
}

#[derive(Parser)]
struct Opts {
    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Print the box tree of a .jp2 file
    Boxes(Boxes),

    /// Summarise the codestream of a .jp2, .jpc or .j2c file
    Codestream(CodestreamOpts),
}

#[derive(Parser)]
struct Boxes {
    /// Path to .jp2 file
    path: String,
}

#[derive(Parser)]
struct CodestreamOpts {
    /// Path to .jp2, .jpc or .j2c file
    path: String,

    /// Number of highest resolution levels to discard
    #[clap(long, default_value_t = 0)]
    discard_levels: u8,

    /// Maximum number of quality layers to keep
    #[clap(long)]
    max_layers: Option<u16>,

    /// Maximum number of image components to keep
    #[clap(long)]
    components: Option<usize>,

    /// Swap the vertical and horizontal axes
    #[clap(long)]
    transpose: bool,

    /// Flip the image vertically
    #[clap(long)]
    vflip: bool,

    /// Flip the image horizontally
    #[clap(long)]
    hflip: bool,
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(OsStr::to_str).unwrap_or("")
}

/// Prints `reader` and its following siblings, descending into super-boxes.
fn print_boxes(reader: &mut BoxReader<'_>, depth: usize) -> Result<(), Box<dyn Error>> {
    loop {
        let box_type = reader.box_type();
        let contents = match reader.box_bytes() {
            Some(length) => (length - reader.header_length()).to_string(),
            None => "to end".to_string(),
        };
        println!(
            "{:indent$}{} at {}: header {}, contents {}",
            "",
            box_type_name(&box_type),
            reader.locator().file_pos().unwrap_or(0),
            reader.header_length(),
            contents,
            indent = depth * 2
        );
        if is_super_box(box_type) {
            let mut sub = BoxReader::new();
            if sub.open_sub(reader)? {
                print_boxes(&mut sub, depth + 1)?;
            }
        }
        if !reader.open_next()? {
            return Ok(());
        }
    }
}

fn boxes(path: &Path) -> Result<(), Box<dyn Error>> {
    let source = ContainerSource::open_file(path)?;
    let mut reader = BoxReader::new();
    if reader.open_first(&source)? {
        print_boxes(&mut reader, 0).map_err(|error| JP2000Error::DecodingContainer {
            error: error.to_string(),
        })?;
    }
    Ok(())
}

fn describe(codestream: &mut Codestream, opts: &CodestreamOpts) -> Result<(), Box<dyn Error>> {
    codestream.apply_input_restrictions(ViewRestrictions {
        discard_levels: opts.discard_levels,
        max_layers: opts.max_layers,
        max_components: opts.components,
        ..ViewRestrictions::default()
    })?;
    codestream.change_appearance(opts.transpose, opts.vflip, opts.hflip);

    let dims = codestream.get_dims(None)?;
    println!(
        "image {}x{} at ({}, {})",
        dims.size.x, dims.size.y, dims.pos.x, dims.pos.y
    );
    let components = codestream.get_num_components(true);
    for c in 0..components {
        let dims = codestream.get_dims(Some(c))?;
        println!(
            "  component {}: {}x{}, {} bits{}",
            c,
            dims.size.x,
            dims.size.y,
            codestream.get_bit_depth(c)?,
            if codestream.get_signed(c)? { " signed" } else { "" }
        );
    }
    println!("layers {}", codestream.num_layers());
    for comment in codestream.comments() {
        println!("comment {:?}", comment);
    }

    let tiles = codestream.get_valid_tiles();
    println!("tiles {}x{}", tiles.size.x, tiles.size.y);
    for y in tiles.pos.y..tiles.lim().y {
        for x in tiles.pos.x..tiles.lim().x {
            let tile = match codestream.open_tile(Coords::new(x, y))? {
                Some(tile) => tile,
                None => continue,
            };
            let dims = codestream.get_tile_dims(Coords::new(x, y), None)?;
            println!(
                "  tile {} ({}, {}): {}x{}",
                tile.number(),
                x,
                y,
                dims.size.x,
                dims.size.y
            );
            for c in 0..components {
                let comp = codestream.tile_comp(tile, c)?;
                for r in 0..codestream.num_resolutions(comp)? {
                    let res = codestream.resolution(comp, r)?;
                    let res_dims = codestream.resolution_dims(res)?;
                    let precincts = codestream.valid_precincts(res)?;
                    println!(
                        "    component {} resolution {}: {}x{}, {} precincts",
                        c,
                        r,
                        res_dims.size.x,
                        res_dims.size.y,
                        precincts.area()
                    );
                }
            }
            codestream.close_tile(tile)?;
        }
    }
    Ok(())
}

fn codestream(opts: &CodestreamOpts) -> Result<(), Box<dyn Error>> {
    let path = Path::new(&opts.path);
    let codestream_error = |error: Box<dyn Error>| -> Box<dyn Error> {
        JP2000Error::DecodingCodestream {
            error: error.to_string(),
        }
        .into()
    };
    match extension(path) {
        "jp2" => {
            let mut jp2 = Jp2Source::new(ContainerSource::open_file(path)?);
            let opened = jp2.open().map_err(|error| JP2000Error::DecodingContainer {
                error: error.to_string(),
            })?;
            let mut stream = BoxReader::new();
            if !opened || !jp2.open_codestream(&mut stream)? {
                return Err(JP2000Error::DecodingContainer {
                    error: "no contiguous codestream box".to_string(),
                }
                .into());
            }
            let mut codestream = Codestream::create_input(&mut stream).map_err(codestream_error)?;
            describe(&mut codestream, opts).map_err(codestream_error)
        }
        "jpc" | "j2c" => {
            let mut codestream =
                Codestream::create_input(FileSource::open(path)?).map_err(codestream_error)?;
            describe(&mut codestream, opts).map_err(codestream_error)
        }
        extension => Err(JP2000Error::UnsupportedExtension {
            extension: extension.to_owned(),
        }
        .into()),
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opts: Opts = Opts::parse();

    match opts.subcommand {
        SubCommand::Boxes(c) => {
            let path = Path::new(&c.path);
            match extension(path) {
                "jp2" => boxes(path),
                extension => Err(JP2000Error::UnsupportedExtension {
                    extension: extension.to_owned(),
                }
                .into()),
            }
        }
        SubCommand::Codestream(c) => codestream(&c),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    match run() {
        Err(e) => Err(e.to_string().into()),
        Ok(_) => Ok(()),
    }
}
