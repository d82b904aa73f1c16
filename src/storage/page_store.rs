use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    cipher::PageCodec,
    storage::header::{DatabaseHeader, FileHeader},
    types::{FILE_HEADER_SIZE, PageId, error::DatabaseError, usable_size},
};

/// The main database file: fixed-size encrypted pages addressed by id.
///
/// Owns the codec (and so the key) of one open database. Every plaintext
/// page passes through the codec on its way in or out; raw images are only
/// exchanged with the WAL.
pub struct PageStore {
    file: File,
    path: PathBuf,
    page_size: usize,
    codec: PageCodec,
    file_header: FileHeader,
    disk_pages: u64,
}

impl PageStore {
    /// Create an empty main file, truncating anything already at `path`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        codec: PageCodec,
        file_header: FileHeader,
    ) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), page_size = file_header.page_size, "created page store");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size: file_header.page_size(),
            codec,
            file_header,
            disk_pages: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        codec: PageCodec,
        file_header: FileHeader,
    ) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let page_size = file_header.page_size();
        let file_size = file.metadata()?.len();
        if file_size % page_size as u64 != 0 {
            warn!(
                path = %path.display(),
                file_size,
                "main file ends with a partial page; ignoring it"
            );
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            codec,
            file_header,
            disk_pages: file_size / page_size as u64,
        })
    }

    /// Read the raw image of page 0 before any key is known.
    pub fn read_header_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, DatabaseError> {
        let mut file = File::open(path)?;
        let mut prefix = vec![0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut prefix)?;
        let header = FileHeader::from_bytes(&prefix)?;
        let mut image = vec![0u8; header.page_size()];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut image)?;
        Ok(image)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Plaintext size of B-tree and free pages.
    pub fn usable_size(&self) -> usize {
        usable_size(self.page_size)
    }

    pub fn file_header(&self) -> &FileHeader {
        &self.file_header
    }

    pub fn codec(&self) -> &PageCodec {
        &self.codec
    }

    /// Number of whole pages currently in the main file.
    pub fn disk_pages(&self) -> u64 {
        self.disk_pages
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id * self.page_size as u64
    }

    /// Plaintext size expected for `page_id`.
    pub fn plaintext_size(&self, page_id: PageId) -> usize {
        if page_id == 0 {
            DatabaseHeader::body_size(self.page_size)
        } else {
            self.usable_size()
        }
    }

    /// Encrypt a plaintext page into its on-disk image.
    pub fn encode_page(&self, page_id: PageId, plaintext: &[u8]) -> Result<Vec<u8>, DatabaseError> {
        let expected = self.plaintext_size(page_id);
        if plaintext.len() != expected {
            return Err(DatabaseError::InvalidPageSize {
                expected,
                actual: plaintext.len(),
            });
        }
        let sealed = self.codec.encrypt_page(page_id, plaintext)?;
        if page_id == 0 {
            let mut image = self.file_header.to_bytes()?;
            image.extend_from_slice(&sealed);
            Ok(image)
        } else {
            Ok(sealed)
        }
    }

    /// Decrypt an on-disk image of `page_id`.
    pub fn decode_page(&self, page_id: PageId, image: &[u8]) -> Result<Vec<u8>, DatabaseError> {
        if image.len() != self.page_size {
            return Err(DatabaseError::InvalidPageSize {
                expected: self.page_size,
                actual: image.len(),
            });
        }
        let sealed = if page_id == 0 {
            &image[FILE_HEADER_SIZE..]
        } else {
            image
        };
        self.codec.decrypt_page(page_id, sealed)
    }

    pub fn read_image(&mut self, page_id: PageId) -> Result<Vec<u8>, DatabaseError> {
        if page_id >= self.disk_pages {
            return Err(DatabaseError::corrupted_page(
                page_id,
                format!("beyond the end of the main file ({} pages)", self.disk_pages),
            ));
        }
        let mut buffer = vec![0u8; self.page_size];
        self.file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn write_image(&mut self, page_id: PageId, image: &[u8]) -> Result<(), DatabaseError> {
        if image.len() != self.page_size {
            return Err(DatabaseError::InvalidPageSize {
                expected: self.page_size,
                actual: image.len(),
            });
        }
        self.file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
        self.file.write_all(image)?;
        self.disk_pages = self.disk_pages.max(page_id + 1);
        Ok(())
    }

    pub fn read_page(&mut self, page_id: PageId) -> Result<Vec<u8>, DatabaseError> {
        let image = self.read_image(page_id)?;
        self.decode_page(page_id, &image)
    }

    pub fn write_page(&mut self, page_id: PageId, plaintext: &[u8]) -> Result<(), DatabaseError> {
        let image = self.encode_page(page_id, plaintext)?;
        self.write_image(page_id, &image)
    }

    /// Force written pages to durable storage.
    pub fn flush(&mut self) -> Result<(), DatabaseError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Switch to a new key; images written afterwards use it.
    pub fn rekey(&mut self, codec: PageCodec, file_header: FileHeader) {
        self.codec = codec;
        self.file_header = file_header;
    }
}
