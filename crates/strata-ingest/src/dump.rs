//! # Debug Dumps
//!
//! Optional per-session raw dumps, written next to each other in the
//! configured directory:
//!
//! - `<stream>.rtp`: each packet as `u16` BE length + RTP bytes
//! - `<stream>.mp2`: container chunks as fed to the demultiplexer
//! - `<stream>.video`: merged video access units (Annex B)
//!
//! Dumping is best-effort. A file that cannot be opened or written is
//! logged once and disabled; the data path never waits on it.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

struct DumpFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl DumpFile {
    fn create(path: PathBuf) -> Option<Self> {
        match File::create(&path) {
            Ok(file) => Some(Self {
                path,
                writer: BufWriter::new(file),
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot create dump file");
                None
            }
        }
    }
}

pub struct SessionDump {
    rtp: Option<DumpFile>,
    container: Option<DumpFile>,
    video: Option<DumpFile>,
}

impl SessionDump {
    /// Open the dump files for `stream_id` under `dir`, creating `dir`.
    pub fn open(dir: &Path, stream_id: &str) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create dump directory");
        }
        let dump = Self {
            rtp: DumpFile::create(dir.join(format!("{stream_id}.rtp"))),
            container: DumpFile::create(dir.join(format!("{stream_id}.mp2"))),
            video: DumpFile::create(dir.join(format!("{stream_id}.video"))),
        };
        info!(dir = %dir.display(), stream_id, "debug dump enabled");
        dump
    }

    pub fn write_rtp(&mut self, packet: &[u8]) {
        let Ok(len) = u16::try_from(packet.len()) else {
            return;
        };
        write_parts(&mut self.rtp, &[&len.to_be_bytes(), packet]);
    }

    pub fn write_container(&mut self, chunk: &[u8]) {
        write_parts(&mut self.container, &[chunk]);
    }

    pub fn write_video(&mut self, frame: &[u8]) {
        write_parts(&mut self.video, &[frame]);
    }

    pub fn flush(&mut self) {
        for slot in [&mut self.rtp, &mut self.container, &mut self.video] {
            if let Some(file) = slot.as_mut() {
                if let Err(e) = file.writer.flush() {
                    warn!(path = %file.path.display(), error = %e, "dump flush failed");
                }
            }
        }
    }

    /// Whether any dump file is still open.
    pub fn is_active(&self) -> bool {
        self.rtp.is_some() || self.container.is_some() || self.video.is_some()
    }
}

impl Drop for SessionDump {
    fn drop(&mut self) {
        self.flush();
    }
}

fn write_parts(slot: &mut Option<DumpFile>, parts: &[&[u8]]) {
    let Some(file) = slot.as_mut() else {
        return;
    };
    let result = parts.iter().try_for_each(|p| file.writer.write_all(p));
    if let Err(e) = result {
        warn!(path = %file.path.display(), error = %e, "dump write failed, dump disabled");
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strata-ingest-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn rtp_records_are_length_prefixed() {
        let dir = scratch_dir("dump-rtp");
        {
            let mut dump = SessionDump::open(&dir, "0000ABCD");
            assert!(dump.is_active());
            dump.write_rtp(&[1, 2, 3]);
            dump.write_rtp(&[4]);
            dump.write_container(b"ps");
        }
        let rtp = fs::read(dir.join("0000ABCD.rtp")).unwrap();
        assert_eq!(rtp, vec![0, 3, 1, 2, 3, 0, 1, 4]);
        assert_eq!(fs::read(dir.join("0000ABCD.mp2")).unwrap(), b"ps");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unwritable_dir_disables_dump() {
        let dir = scratch_dir("dump-bad");
        fs::write(&dir, b"not a directory").unwrap();
        let mut dump = SessionDump::open(&dir, "00000001");
        assert!(!dump.is_active());
        dump.write_rtp(&[1]);
        let _ = fs::remove_file(&dir);
    }
}
