pub mod plate;
mod slice_info;

use tracing::{debug, error, info, trace, warn};

use base64::Engine;
use bytes::Bytes;
use std::io::{Cursor, Read};

pub use self::plate::{Plate, PlateFilament};

pub const FILE_3MF: &str = ".3mf";

const SLICE_INFO: &str = "Metadata/slice_info.config";
const MODEL_SETTINGS: &str = "Metadata/model_settings.config";

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Only .3mf files are supported: {0}")]
    NotProjectFile(String),
    #[error("File too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: u64, max: u64 },
    #[error("Unable to open project archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Project archive is not sliced, missing {0}")]
    MissingEntry(String),
    #[error("Unable to read {entry}: {source}")]
    Io {
        entry: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown plate: {0}")]
    UnknownPlate(u32),
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("Filament slot out of range: {0}")]
    InvalidFilament(u64),
}

/// A parsed, sliced project archive. The raw bytes are kept so the file can be
/// uploaded to printers as-is.
#[derive(Debug)]
pub struct ProjectFile {
    id: String,
    filename: String,
    data: Bytes,
    plates: Vec<Plate>,
}

impl ProjectFile {
    /// `filename` is also the name the archive gets on each printer, so it
    /// must be a plain file name
    pub fn setup(filename: &str, data: impl Into<Bytes>) -> Result<Self, ProjectError> {
        if filename.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
            return Err(ProjectError::InvalidFileName(filename.to_string()));
        }
        if !filename.to_ascii_lowercase().ends_with(FILE_3MF) {
            return Err(ProjectError::NotProjectFile(filename.to_string()));
        }
        let data: Bytes = data.into();
        let mut archive = zip::ZipArchive::new(Cursor::new(data.clone()))?;

        let slice_info = read_entry_string(&mut archive, SLICE_INFO)?
            .ok_or_else(|| ProjectError::MissingEntry(SLICE_INFO.to_string()))?;
        let names = read_entry_string(&mut archive, MODEL_SETTINGS)?
            .map(|s| slice_info::parse_plate_names(&s))
            .unwrap_or_default();

        let mut plates = vec![];
        for sliced in slice_info::parse_slice_info(&slice_info)? {
            let gcode = Plate::gcode_path_for(sliced.index);
            if archive.index_for_name(&gcode).is_none() {
                debug!("plate {} has no gcode, skipping", sliced.index);
                continue;
            }
            plates.push(Plate {
                index: sliced.index,
                name: names
                    .get(&sliced.index)
                    .cloned()
                    .unwrap_or_else(|| format!("Plate {}", sliced.index)),
                prediction: sliced.prediction,
                weight: sliced.weight,
                filaments: sliced.filaments,
                thumbnail: Plate::thumbnail_path_for(sliced.index),
            });
        }

        let out = Self {
            id: nanoid::nanoid!(8),
            filename: filename.to_string(),
            data,
            plates,
        };
        info!(
            "opened project file[{}] id[{}] size[{}] plates[{}]",
            out.filename,
            out.id,
            out.data.len(),
            out.plates.len()
        );
        Ok(out)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn plates(&self) -> &[Plate] {
        &self.plates
    }

    pub fn plate(&self, index: u32) -> Option<&Plate> {
        self.plates.iter().find(|p| p.index == index)
    }

    /// PNG preview of a plate, `None` if the slicer did not store one
    pub fn thumbnail(&self, plate: &Plate) -> Result<Option<Vec<u8>>, ProjectError> {
        if self.plate(plate.index).is_none() {
            return Err(ProjectError::UnknownPlate(plate.index));
        }
        let mut archive = zip::ZipArchive::new(Cursor::new(self.data.clone()))?;
        read_entry(&mut archive, &plate.thumbnail)
    }

    /// The thumbnail as a `data:` URL, ready to be shown as an image source
    pub fn thumbnail_data_url(&self, plate: &Plate) -> Result<Option<String>, ProjectError> {
        Ok(self.thumbnail(plate)?.map(|png| {
            format!(
                "data:image/png;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(png)
            )
        }))
    }
}

impl Drop for ProjectFile {
    fn drop(&mut self) {
        debug!("released project file[{}] id[{}]", self.filename, self.id);
    }
}

fn read_entry(
    archive: &mut zip::ZipArchive<Cursor<Bytes>>,
    name: &str,
) -> Result<Option<Vec<u8>>, ProjectError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .map_err(|source| ProjectError::Io {
            entry: name.to_string(),
            source,
        })?;
    Ok(Some(buf))
}

fn read_entry_string(
    archive: &mut zip::ZipArchive<Cursor<Bytes>>,
    name: &str,
) -> Result<Option<String>, ProjectError> {
    Ok(read_entry(archive, name)?.map(|b| String::from_utf8_lossy(&b).into_owned()))
}

#[cfg(test)]
pub(crate) mod test_archive {
    use std::io::{Cursor, Write};

    use zip::{write::SimpleFileOptions, ZipWriter};

    /// Builds a sliced archive with one `<plate>` per `(index, filaments)`
    /// entry; `(type, color)` per filament.
    pub(crate) fn sliced_archive(plates: &[(u32, &[(&str, &str)])]) -> Vec<u8> {
        let mut slice_info = String::from("<?xml version=\"1.0\"?>\n<config>\n");
        for (index, filaments) in plates {
            slice_info.push_str(&format!(
                "<plate>\n<metadata key=\"index\" value=\"{index}\"/>\n\
                 <metadata key=\"prediction\" value=\"{}\"/>\n\
                 <metadata key=\"weight\" value=\"{}.5\"/>\n",
                600 * index,
                index
            ));
            for (i, (t, c)) in filaments.iter().enumerate() {
                slice_info.push_str(&format!(
                    "<filament id=\"{}\" type=\"{t}\" color=\"{c}\" used_m=\"1.00\" used_g=\"3.00\" />\n",
                    i + 1
                ));
            }
            slice_info.push_str("</plate>\n");
        }
        slice_info.push_str("</config>\n");

        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            let options = SimpleFileOptions::default();
            zip.start_file("3D/3dmodel.model", options).unwrap();
            zip.write_all(b"<model/>").unwrap();
            zip.start_file("Metadata/slice_info.config", options).unwrap();
            zip.write_all(slice_info.as_bytes()).unwrap();
            for (index, _) in plates {
                zip.start_file(format!("Metadata/plate_{index}.gcode"), options)
                    .unwrap();
                zip.write_all(b"G28\n").unwrap();
                zip.start_file(format!("Metadata/plate_{index}.png"), options)
                    .unwrap();
                zip.write_all(b"\x89PNG fake").unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }
}
