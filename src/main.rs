use anyhow::{bail, Context, Result};
use bio::io::fasta;
use clap::Parser;
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Length in bp of the decorative telomere cap drawn at each end of a track.
/// Counted twice in the shared horizontal scale so all tracks are comparable.
const TELOMERE_LENGTH: u64 = 200_000;

const TRACK_HEIGHT: f64 = 28.0;
const TRACK_GAP: f64 = 18.0;
const TITLE_HEIGHT: f64 = 36.0;
const BOTTOM_PADDING: f64 = 10.0;

#[derive(Parser)]
#[command(name = "busco2chrom", version)]
#[command(about = "Map BUSCOs coloured by reference (ancestral) chromosome onto a query assembly.", long_about = None)]
struct Args {
    /// Reference BUSCO full table assigning BUSCO ids to chromosome labels.
    #[arg(short = 'r', long = "ref-table", value_name = "FILE")]
    ref_table: PathBuf,

    /// Query assembly in FASTA format.
    #[arg(short = 'q', long = "query-fasta", value_name = "FILE")]
    query_fasta: PathBuf,

    /// Query BUSCO full table with hit coordinates on the assembly.
    #[arg(short = 't', long = "query-table", value_name = "FILE")]
    query_table: PathBuf,

    /// Write the karyotype plot to this SVG file.
    #[arg(short = 'o', long = "out", value_name = "FILE", default_value = "output.svg")]
    out: PathBuf,

    /// Minimum length for a sequence to be considered a chromosome.
    #[arg(short = 'm', long = "min-length", value_name = "BP", default_value_t = 1_000_000)]
    min_length: i64,

    /// Minimum number of BUSCOs required to assign ancestry to a scaffold.
    #[arg(short = 'b', long = "min-buscos", value_name = "N", default_value_t = 10)]
    min_buscos: u32,

    /// Width in pixels of the rendered plot.
    #[arg(long = "width", value_name = "N", default_value_t = 1600)]
    width: u32,

    /// Print per-record and per-row diagnostics.
    #[arg(long = "verbose")]
    verbose: bool,
}

/// One sequence from the query assembly that passed the length filter.
#[derive(Debug, Clone)]
struct Scaffold {
    name: String,
    length: u64,
}

/// Survey of the query assembly: surviving scaffolds in file order, plus the
/// longest record length over the whole file (pre-filter), which becomes the
/// shared scale for every track.
struct Assembly {
    scaffolds: Vec<Scaffold>,
    name_to_id: FxHashMap<String, usize>,
    max_len: u64,
}

/// Reference side of the join: BUSCO id -> chromosome label index, with the
/// labels kept in first-encounter order for colour assignment.
struct ReferenceMap {
    chrom_of: FxHashMap<String, usize>,
    labels: Vec<String>,
}

/// A kept query BUSCO hit, joined to a scaffold and a reference chromosome.
#[derive(Debug, Clone)]
struct Feature {
    start: u64,
    end: u64,
    label: usize,
    /// Display tag, "<chromosome>_<buscoId>".
    tag: String,
}

/// Parse the query assembly, keeping sequences strictly longer than
/// `min_length` and tracking the maximum length over all records.
fn parse_assembly(path: &Path, min_length: i64) -> Result<Assembly> {
    let reader = fasta::Reader::from_file(path)
        .with_context(|| format!("cannot open query fasta {}", path.display()))?;

    let mut scaffolds = Vec::new();
    let mut name_to_id = FxHashMap::default();
    let mut max_len = 0u64;

    for result in reader.records() {
        let record = result
            .with_context(|| format!("error while reading fasta record from {}", path.display()))?;
        let length = record.seq().len() as u64;
        max_len = max_len.max(length);
        if length as i64 > min_length {
            debug!(
                "{} {} length: {}",
                record.id(),
                record.desc().unwrap_or(""),
                length
            );
            name_to_id.insert(record.id().to_string(), scaffolds.len());
            scaffolds.push(Scaffold {
                name: record.id().to_string(),
                length,
            });
        }
    }

    Ok(Assembly {
        scaffolds,
        name_to_id,
        max_len,
    })
}

/// Read data rows of a tab-separated table, skipping `#` comment lines and
/// blank lines. Returns (1-based line number, fields) per row.
fn read_table(path: &Path) -> Result<Vec<(usize, Vec<String>)>> {
    let file = File::open(path).with_context(|| format!("cannot open table {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read error in {}", path.display()))?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rows.push((idx + 1, line.split('\t').map(str::to_string).collect()));
    }
    Ok(rows)
}

/// Parse the reference BUSCO table, keeping rows with status "Complete".
/// Chromosome labels are numbered in first-encounter order; a BUSCO id seen
/// twice keeps its last assignment.
fn parse_reference_table(path: &Path) -> Result<ReferenceMap> {
    let mut chrom_of: FxHashMap<String, usize> = FxHashMap::default();
    let mut labels: Vec<String> = Vec::new();
    let mut label_index: FxHashMap<String, usize> = FxHashMap::default();

    for (lineno, fields) in read_table(path)? {
        let status = fields.get(1).with_context(|| {
            format!(
                "{}:{}: expected at least 2 tab-separated columns",
                path.display(),
                lineno
            )
        })?;
        if status != "Complete" {
            continue;
        }
        let label = fields.get(2).with_context(|| {
            format!(
                "{}:{}: complete BUSCO row without a chromosome column",
                path.display(),
                lineno
            )
        })?;
        debug!("{:?}", fields);
        let id = *label_index.entry(label.clone()).or_insert_with(|| {
            labels.push(label.clone());
            labels.len() - 1
        });
        chrom_of.insert(fields[0].clone(), id);
    }

    Ok(ReferenceMap { chrom_of, labels })
}

/// Parse the query BUSCO table and join each kept row to its scaffold and
/// reference chromosome. A row is kept only if its status is "Complete", its
/// BUSCO id exists in the reference map and its scaffold survived the length
/// filter. Rows sharing a BUSCO id are all kept. Returns the features grouped
/// by scaffold index, in row order.
fn parse_query_table(
    path: &Path,
    reference: &ReferenceMap,
    assembly: &Assembly,
) -> Result<Vec<Vec<Feature>>> {
    let mut features: Vec<Vec<Feature>> = vec![Vec::new(); assembly.scaffolds.len()];
    let mut kept = 0usize;

    for (lineno, fields) in read_table(path)? {
        if fields.len() < 3 {
            bail!(
                "{}:{}: expected at least 3 tab-separated columns",
                path.display(),
                lineno
            );
        }
        if fields[1] != "Complete" {
            continue;
        }
        let Some(&label) = reference.chrom_of.get(&fields[0]) else {
            continue;
        };
        let Some(&scaffold_id) = assembly.name_to_id.get(&fields[2]) else {
            continue;
        };
        let start: u64 = fields
            .get(3)
            .with_context(|| format!("{}:{}: missing start column", path.display(), lineno))?
            .parse()
            .with_context(|| format!("{}:{}: start is not an integer", path.display(), lineno))?;
        let end: u64 = fields
            .get(4)
            .with_context(|| format!("{}:{}: missing end column", path.display(), lineno))?
            .parse()
            .with_context(|| format!("{}:{}: end is not an integer", path.display(), lineno))?;
        debug!("{:?}", fields);

        features[scaffold_id].push(Feature {
            start,
            end,
            label,
            tag: format!("{}_{}", reference.labels[label], fields[0]),
        });
        kept += 1;
    }

    info!("{} query BUSCO hits mapped", kept);
    Ok(features)
}

/// Evenly spaced hues in HLS space (hue offset 0.01, lightness 0.6,
/// saturation 0.65), one colour per reference chromosome label.
fn hls_palette(n: usize) -> Vec<(u8, u8, u8)> {
    (0..n)
        .map(|i| {
            let hue = (i as f64 / n as f64 + 0.01) % 1.0;
            let (r, g, b) = hls_to_rgb(hue, 0.6, 0.65);
            (
                (r * 255.0).round() as u8,
                (g * 255.0).round() as u8,
                (b * 255.0).round() as u8,
            )
        })
        .collect()
}

fn hls_to_rgb(h: f64, l: f64, s: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (l, l, l);
    }
    let m2 = if l <= 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let m1 = 2.0 * l - m2;
    (
        hue_component(m1, m2, h + 1.0 / 3.0),
        hue_component(m1, m2, h),
        hue_component(m1, m2, h - 1.0 / 3.0),
    )
}

fn hue_component(m1: f64, m2: f64, hue: f64) -> f64 {
    let hue = hue.rem_euclid(1.0);
    if hue < 1.0 / 6.0 {
        m1 + (m2 - m1) * hue * 6.0
    } else if hue < 0.5 {
        m2
    } else if hue < 2.0 / 3.0 {
        m1 + (m2 - m1) * (2.0 / 3.0 - hue) * 6.0
    } else {
        m1
    }
}

/// Escape special XML characters
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Render the karyotype plot as SVG: one horizontal track per surviving
/// scaffold, telomere caps at both ends, and one coloured marker per mapped
/// BUSCO. All tracks share the scale max_len + 2 * TELOMERE_LENGTH.
fn render_svg(
    assembly: &Assembly,
    features: &[Vec<Feature>],
    palette: &[(u8, u8, u8)],
    width: u32,
    title: &str,
) -> String {
    let scale_num = assembly.max_len + 2 * TELOMERE_LENGTH;
    let font_size = 12.0;
    let char_width = font_size * 0.6; // Approximate monospace character width
    let max_name_len = assembly
        .scaffolds
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(10);
    let name_width = max_name_len as f64 * char_width + 10.0;
    let draw_width = (width as f64 - name_width).max(100.0);
    let px_per_bp = draw_width / scale_num as f64;
    let tel_px = TELOMERE_LENGTH as f64 * px_per_bp;

    let total_width = name_width + draw_width;
    let total_height = TITLE_HEIGHT
        + assembly.scaffolds.len() as f64 * (TRACK_HEIGHT + TRACK_GAP)
        + BOTTOM_PADDING;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{:.1}" height="{:.1}" viewBox="0 0 {:.1} {:.1}">
<style>
  .title {{ font-family: 'DejaVu Sans Mono', 'Courier New', monospace; font-size: 14px; font-weight: bold; }}
  .scaffold-name {{ font-family: 'DejaVu Sans Mono', 'Courier New', monospace; font-size: {}px; }}
  .busco-label {{ font-family: 'DejaVu Sans Mono', 'Courier New', monospace; font-size: 5px; }}
  .segment {{ fill: white; stroke: black; stroke-width: 0.75; }}
  .telomere {{ fill: #d9d9d9; stroke: black; stroke-width: 0.75; }}
</style>
<rect width="100%" height="100%" fill="white"/>
"#,
        total_width, total_height, total_width, total_height, font_size
    ));

    svg.push_str(&format!(
        r#"<text x="{:.1}" y="22.0" class="title">{}</text>"#,
        name_width,
        escape_xml(title)
    ));
    svg.push('\n');

    for (i, scaffold) in assembly.scaffolds.iter().enumerate() {
        let y = TITLE_HEIGHT + i as f64 * (TRACK_HEIGHT + TRACK_GAP);
        let x_body = name_width + tel_px;
        let body_px = scaffold.length as f64 * px_per_bp;

        let text_y = y + TRACK_HEIGHT / 2.0 + font_size / 3.0;
        svg.push_str(&format!(
            r#"<text x="5.0" y="{:.1}" class="scaffold-name">{}</text>"#,
            text_y,
            escape_xml(&scaffold.name)
        ));
        svg.push('\n');

        // Opening telomere: half-ellipse bulging left of the body.
        svg.push_str(&format!(
            r#"<path d="M{:.1},{:.1} A{:.1},{:.1} 0 0 0 {:.1},{:.1} Z" class="telomere"/>"#,
            x_body,
            y,
            tel_px,
            TRACK_HEIGHT / 2.0,
            x_body,
            y + TRACK_HEIGHT
        ));
        svg.push('\n');

        svg.push_str(&format!(
            r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" class="segment"/>"#,
            x_body, y, body_px, TRACK_HEIGHT
        ));
        svg.push('\n');

        // Closing telomere, mirrored.
        svg.push_str(&format!(
            r#"<path d="M{:.1},{:.1} A{:.1},{:.1} 0 0 1 {:.1},{:.1} Z" class="telomere"/>"#,
            x_body + body_px,
            y,
            tel_px,
            TRACK_HEIGHT / 2.0,
            x_body + body_px,
            y + TRACK_HEIGHT
        ));
        svg.push('\n');

        for feature in &features[i] {
            let fx = x_body + feature.start as f64 * px_per_bp;
            let fw = (feature.end.saturating_sub(feature.start) as f64 * px_per_bp).max(0.5);
            let (r, g, b) = palette[feature.label];
            svg.push_str(&format!(
                r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="rgb({},{},{})"><title>{}</title></rect>"#,
                fx,
                y,
                fw,
                TRACK_HEIGHT,
                r,
                g,
                b,
                escape_xml(&feature.tag)
            ));
            svg.push('\n');
            svg.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" class="busco-label" transform="rotate(-45 {:.1} {:.1})">{}</text>"#,
                fx,
                y - 2.0,
                fx,
                y - 2.0,
                escape_xml(&feature.tag)
            ));
            svg.push('\n');
        }
    }

    svg.push_str("</svg>\n");
    svg
}

/// Count chromosome label occurrences among a scaffold's features, keeping
/// labels in first-appearance order.
fn ordered_tally(features: &[Feature]) -> Vec<(usize, u32)> {
    let mut order: Vec<usize> = Vec::new();
    let mut counts: FxHashMap<usize, u32> = FxHashMap::default();
    for feature in features {
        let count = counts.entry(feature.label).or_insert_with(|| {
            order.push(feature.label);
            0
        });
        *count += 1;
    }
    order.into_iter().map(|label| (label, counts[&label])).collect()
}

/// Build one rename-suggestion line per surviving scaffold:
/// `<id>\t<id>_<L1>(<n1>)...\t\t<id>_<L1>...`, keeping only labels with at
/// least `min_buscos` mapped BUSCOs. Suffixes stay empty when no label
/// qualifies; the line is still printed.
fn rename_report(
    assembly: &Assembly,
    features: &[Vec<Feature>],
    labels: &[String],
    min_buscos: u32,
) -> Vec<String> {
    let mut lines = Vec::with_capacity(assembly.scaffolds.len());
    for (i, scaffold) in assembly.scaffolds.iter().enumerate() {
        let qualifying: Vec<(usize, u32)> = ordered_tally(&features[i])
            .into_iter()
            .filter(|&(_, count)| count >= min_buscos)
            .collect();

        let mut with_counts = String::new();
        let mut bare = String::new();
        for &(label, count) in &qualifying {
            with_counts.push_str(&format!("{}({})", labels[label], count));
            bare.push_str(&labels[label]);
        }
        lines.push(format!(
            "{id}\t{id}_{with_counts}\t\t{id}_{bare}",
            id = scaffold.name
        ));
    }
    lines
}

fn run(args: &Args) -> Result<()> {
    if args.min_length < 0 {
        bail!(
            "minimum size threshold must be a positive integer (got {})",
            args.min_length
        );
    }

    info!("Parsing fasta {}", args.query_fasta.display());
    let assembly = parse_assembly(&args.query_fasta, args.min_length)?;
    info!(
        "{} sequences over the minimum size threshold (-m {})",
        assembly.scaffolds.len(),
        args.min_length
    );
    if assembly.scaffolds.is_empty() {
        bail!("no sequences above minimum length threshold");
    }

    info!("Parsing BUSCO tables");
    let reference = parse_reference_table(&args.ref_table)?;
    info!(
        "{} complete reference BUSCOs across {} chromosomes",
        reference.chrom_of.len(),
        reference.labels.len()
    );
    let features = parse_query_table(&args.query_table, &reference, &assembly)?;

    let palette = hls_palette(reference.labels.len());

    info!("Building one-sided alignment karyotype plot");
    let svg = render_svg(
        &assembly,
        &features,
        &palette,
        args.width,
        &args.query_fasta.display().to_string(),
    );

    let mut file = File::create(&args.out)
        .with_context(|| format!("cannot create output file {}", args.out.display()))?;
    file.write_all(svg.as_bytes())
        .with_context(|| format!("error writing {}", args.out.display()))?;
    info!("Karyotype plot saved to {}", args.out.display());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in rename_report(&assembly, &features, &reference.labels, args.min_buscos) {
        writeln!(out, "{}", line)?;
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if let Err(e) = run(&args) {
        eprintln!("ERROR: {:#}", e);
        std::process::exit(1);
    }
}
