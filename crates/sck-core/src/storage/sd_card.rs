use embedded_sdmmc::{BlockDevice, Error, Mode, TimeSource, VolumeIdx, VolumeManager};

use super::card::CardFs;

const COPY_CHUNK: usize = 512;

/// [`CardFs`] over the root directory of the first FAT volume.
///
/// These operations are blocking, like every other access to the SPI bus
/// the card sits on.
pub struct SdCardFs<B, T>
where
    B: BlockDevice,
    T: TimeSource,
{
    volume_mgr: VolumeManager<B, T, 4, 4, 1>,
}

impl<B, T> SdCardFs<B, T>
where
    B: BlockDevice,
    T: TimeSource,
{
    pub fn new(block_device: B, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(block_device, ts);

        Self { volume_mgr }
    }
}

impl<B, T> CardFs for SdCardFs<B, T>
where
    B: BlockDevice,
    T: TimeSource,
{
    type Error = Error<B::Error>;

    fn probe(&mut self) -> Result<(), Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        volume0.close()?;
        Ok(())
    }

    fn exists(&mut self, name: &str) -> Result<bool, Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let found = match root_dir.find_directory_entry(name) {
            Ok(_) => true,
            Err(Error::NotFound) => false,
            Err(e) => return Err(e),
        };

        root_dir.close()?;
        volume0.close()?;
        Ok(found)
    }

    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(name, Mode::ReadWriteCreateOrAppend)?;

        file.write(data)?;

        // Dropping would close these too, but close reports errors.
        file.close()?;
        root_dir.close()?;
        volume0.close()?;
        Ok(())
    }

    fn size(&mut self, name: &str) -> Result<u32, Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(name, Mode::ReadOnly)?;
        let length = file.length();

        file.close()?;
        root_dir.close()?;
        volume0.close()?;
        Ok(length)
    }

    /// FAT rename is not available, so the file is copied and then deleted.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let source = root_dir.open_file_in_dir(from, Mode::ReadOnly)?;
        let target = root_dir.open_file_in_dir(to, Mode::ReadWriteCreateOrTruncate)?;

        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            let read = source.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            target.write(&chunk[..read])?;
        }

        target.close()?;
        source.close()?;
        root_dir.delete_file_in_dir(from)?;

        root_dir.close()?;
        volume0.close()?;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        root_dir.delete_file_in_dir(name)?;

        root_dir.close()?;
        volume0.close()?;
        Ok(())
    }
}
