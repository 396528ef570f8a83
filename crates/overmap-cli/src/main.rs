use clap::{Parser, Subcommand};
use overmap::persist::is_world_root;
use overmap::{sample, MapConfig, MapSession, MapStorage, PaletteColor, WindowBuffer};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "overmap-cli", about = "Inspect and export overmap world saves")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a world save's manifest and chunk inventory
    Info {
        /// World save directory
        #[arg(long, short)]
        world: PathBuf,
        /// List every chunk record
        #[arg(long)]
        chunks: bool,
    },
    /// Export a window of the map around a world position to a PNG
    Export {
        /// World save directory
        #[arg(long, short)]
        world: PathBuf,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        center_x: i32,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        center_z: i32,
        /// Window edge length in pixels
        #[arg(long, default_value_t = 128)]
        size: u32,
        /// Output PNG path
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Delete every chunk record and start the world over
    Reset {
        /// World save directory
        #[arg(long, short)]
        world: PathBuf,
    },
}

/// Base RGB per palette family, indexed by family id. The store only
/// deals in palette indices; this table is the consumer-side translation
/// used for PNG export. Families past the table render as transparent.
const BASE_COLORS: [[u8; 3]; 62] = [
    [0, 0, 0],
    [127, 178, 56],
    [247, 233, 163],
    [199, 199, 199],
    [255, 0, 0],
    [160, 160, 255],
    [167, 167, 167],
    [0, 124, 0],
    [255, 255, 255],
    [164, 168, 184],
    [151, 109, 77],
    [112, 112, 112],
    [64, 64, 255],
    [143, 119, 72],
    [255, 252, 245],
    [216, 127, 51],
    [178, 76, 216],
    [102, 153, 216],
    [229, 229, 51],
    [127, 204, 25],
    [242, 127, 165],
    [76, 76, 76],
    [153, 153, 153],
    [76, 127, 153],
    [127, 63, 178],
    [51, 76, 178],
    [102, 76, 51],
    [102, 127, 51],
    [153, 51, 51],
    [25, 25, 25],
    [250, 238, 77],
    [92, 219, 213],
    [74, 128, 255],
    [0, 217, 58],
    [129, 86, 49],
    [112, 2, 0],
    [209, 177, 161],
    [159, 82, 36],
    [149, 87, 108],
    [112, 108, 138],
    [186, 133, 36],
    [103, 117, 53],
    [160, 77, 78],
    [57, 41, 35],
    [135, 107, 98],
    [87, 92, 92],
    [122, 73, 88],
    [76, 62, 92],
    [76, 50, 35],
    [76, 82, 42],
    [142, 60, 46],
    [37, 22, 16],
    [189, 48, 49],
    [148, 63, 97],
    [92, 25, 29],
    [22, 126, 134],
    [58, 142, 140],
    [86, 44, 62],
    [20, 180, 133],
    [100, 100, 100],
    [216, 175, 147],
    [127, 167, 150],
];

/// Brightness multiplier per shade, applied as `base * factor / 255`.
const SHADE_FACTORS: [u32; 4] = [180, 220, 255, 135];

fn render_color(color: PaletteColor) -> Option<[u8; 4]> {
    if color.is_transparent() {
        return None;
    }
    let base = BASE_COLORS.get(color.family as usize)?;
    let factor = SHADE_FACTORS[color.shade as usize];
    Some([
        (base[0] as u32 * factor / 255) as u8,
        (base[1] as u32 * factor / 255) as u8,
        (base[2] as u32 * factor / 255) as u8,
        255,
    ])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Info { world, chunks } => cmd_info(world, chunks),
        Command::Export {
            world,
            center_x,
            center_z,
            size,
            output,
        } => cmd_export(world, center_x, center_z, size, output),
        Command::Reset { world } => cmd_reset(world),
    }
}

fn require_world_root(world: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !is_world_root(world) {
        return Err(format!("{} is not a world save directory", world.display()).into());
    }
    Ok(())
}

fn cmd_info(world: PathBuf, list_chunks: bool) -> Result<(), Box<dyn std::error::Error>> {
    require_world_root(&world)?;
    let storage = MapStorage::open(&world)?;
    let manifest = storage.load_manifest()?;
    println!("format:        {} v{}", manifest.format, manifest.version);
    println!("created:       {} ms since epoch", manifest.created_ms);
    println!("last modified: {} ms since epoch", manifest.last_modified_ms);

    let mut positions = storage.scan_chunk_positions()?;
    positions.sort_by_key(|pos| (pos.z, pos.x));
    println!("chunks:        {}", positions.len());
    if let (Some(min_x), Some(max_x)) = (
        positions.iter().map(|p| p.x).min(),
        positions.iter().map(|p| p.x).max(),
    ) {
        let min_z = positions.iter().map(|p| p.z).min().unwrap_or(0);
        let max_z = positions.iter().map(|p| p.z).max().unwrap_or(0);
        println!("extent:        x {min_x}..={max_x}, z {min_z}..={max_z}");
    }

    if list_chunks {
        for pos in positions {
            match storage.load_chunk(pos) {
                Ok(Some(chunk)) => println!(
                    "  ({:>6}, {:>6})  seq {:>6}  {:>5} px set",
                    pos.x,
                    pos.z,
                    chunk.sequence,
                    chunk.set_pixel_count()
                ),
                Ok(None) => {}
                Err(error) => println!("  ({:>6}, {:>6})  unreadable: {error}", pos.x, pos.z),
            }
        }
    }
    Ok(())
}

fn cmd_export(
    world: PathBuf,
    center_x: i32,
    center_z: i32,
    size: u32,
    output: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    require_world_root(&world)?;
    if size == 0 {
        return Err("window size must be at least 1".into());
    }

    let session = MapSession::open(MapConfig::with_defaults(world))?;
    let loaded = session.ensure_window_resident(center_x, center_z, size, size)?;
    log::debug!("pre-faulted {loaded} chunks for export");

    let mut window = WindowBuffer::new(size, size);
    {
        let map = session.lock_world();
        sample(&map, center_x, center_z, &mut window);
    }
    session.close();

    let mut img = image::RgbaImage::new(size, size);
    let mut drawn = 0usize;
    for z in 0..size {
        for x in 0..size {
            let color = PaletteColor::from_packed(window.pixel(x, z));
            if let Some(rgba) = render_color(color) {
                img.put_pixel(x, z, image::Rgba(rgba));
                drawn += 1;
            }
        }
    }
    img.save(&output)?;
    println!(
        "wrote {}x{size} window centered on ({center_x}, {center_z}) to {} ({drawn} pixels set)",
        size,
        output.display()
    );
    Ok(())
}

fn cmd_reset(world: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    require_world_root(&world)?;
    let storage = MapStorage::open(&world)?;
    storage.reset_world()?;
    println!("world reset: {}", world.display());
    Ok(())
}
