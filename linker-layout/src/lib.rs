//! Serializable description of what the backend produced: the patched input
//! section images, the linker-created sections (GOT, PLT, stubs, dynamic
//! relocations) and the dynamic table. The container writer consumes this to
//! assemble the final file; tools can also dump it for inspection.

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::io::Read;
use std::io::Write;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub sections: Vec<SectionImage>,
    pub dynamic: Vec<DynamicEntry>,
    /// Names of the dynamic symbol table entries, in index order starting at
    /// index 1; relocation records refer to these indices.
    pub dynamic_symbols: Vec<String>,
}

/// One output section with fully patched contents. `address` is the memory
/// address the backend assumed while patching; the writer must place the
/// section there.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SectionImage {
    pub name: String,
    pub address: u64,
    pub alignment: u64,
    /// Empty for sections with no file content (BSS-style allocations);
    /// `mem_size` still records the memory footprint.
    pub bytes: Vec<u8>,
    pub mem_size: u64,
}

/// A (tag, value) pair destined for the `.dynamic` section.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicEntry {
    pub tag: u32,
    pub value: u32,
}

impl Layout {
    pub fn write(&self, mut writer: impl Write) -> Result<()> {
        let bytes = postcard::to_allocvec(self)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Layout> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(postcard::from_bytes(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialise_deserialise() {
        let layout = Layout {
            sections: vec![SectionImage {
                name: ".text".to_owned(),
                address: 0x1000_0000,
                alignment: 4,
                bytes: vec![0x60, 0, 0, 0],
                mem_size: 4,
            }],
            dynamic: vec![DynamicEntry {
                tag: 3,
                value: 0x1001_0000,
            }],
            dynamic_symbols: vec!["malloc".to_owned()],
        };
        let mut bytes = Vec::new();
        layout.write(&mut bytes).unwrap();
        let restored = Layout::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(restored, layout);
    }
}
