//! NSP assembly: compose the Program/Control/Manual/Meta NCAs from user
//! inputs and package them into a PFS0 submission package.
//!
//! The pipeline mirrors the layout of a retail package: the ExeFS map
//! becomes the Program NCA's first section (with optional RomFS and logo
//! sections), the control map becomes the Control NCA's RomFS, optional
//! HtmlDocument/LegalInformation trees become Manual NCAs, and a CNMT
//! derived from the finished NCAs' hashes is wrapped into the Meta NCA that
//! closes the package.

use crate::crypto::NcaSigner;
use crate::error::{Error, Result};
use crate::formats::cnmt::{Cnmt, ContentRecord, PackagedContentType};
use crate::formats::ivfc::IVFC_BLOCK_SIZE;
use crate::formats::keyset::Keyset;
use crate::formats::nacp;
use crate::formats::nca::{
    build_nca, pfs0_section, romfs_section, BuiltNca, ContentType, EncryptionType, NcaParams,
    NcaSectionData,
};
use crate::formats::npdm::patch_npdm;
use crate::formats::pfs0::Pfs0Builder;
use crate::formats::romfs::{build_romfs, RomFsEntry};
use crate::io::align_up;

/// PFS0 hash-table block sizes per section flavor.
const EXEFS_BLOCK_SIZE: u32 = 0x10000;
const LOGO_BLOCK_SIZE: u32 = 0x1000;
const META_BLOCK_SIZE: u32 = 0x1000;

/// An ordered name-to-bytes mapping, preserved into PFS0 entry order.
pub type FileMap = Vec<(String, Vec<u8>)>;

/// Key material input: either keyfile text to derive from, or an already
/// derived set.
pub enum KeyInput {
    Text(String),
    Set(Keyset),
}

/// Inputs and switches for [`build_nsp`].
pub struct NspBuildOptions {
    pub keys: KeyInput,
    /// ExeFS contents; must contain `main.npdm`.
    pub exefs: FileMap,
    /// Control contents; must contain `control.nacp` and at least one icon.
    pub control: FileMap,
    pub romfs: Option<RomFsEntry>,
    pub logo: Option<FileMap>,
    pub htmldoc: Option<RomFsEntry>,
    pub legalinfo: Option<RomFsEntry>,

    /// Replaces the NPDM's title id when set.
    pub title_id: Option<u64>,
    pub key_generation: u8,
    pub key_area_key: [u8; 0x10],
    pub sdk_version: u32,
    pub plaintext: bool,
    pub no_logo: bool,
    pub no_patch_nacp_logo: bool,
    pub no_patch_acid_key: bool,
    pub no_sign_nca_sig2: bool,
    pub title_name: Option<String>,
    pub title_publisher: Option<String>,
}

impl NspBuildOptions {
    /// Options with the required inputs and default switches.
    pub fn new(keys: KeyInput, exefs: FileMap, control: FileMap) -> Self {
        Self {
            keys,
            exefs,
            control,
            romfs: None,
            logo: None,
            htmldoc: None,
            legalinfo: None,
            title_id: None,
            key_generation: 1,
            key_area_key: [0x04; 0x10],
            sdk_version: 0x000C1100,
            plaintext: false,
            no_logo: false,
            no_patch_nacp_logo: false,
            no_patch_acid_key: false,
            no_sign_nca_sig2: false,
            title_name: None,
            title_publisher: None,
        }
    }
}

/// A finished package.
#[derive(Debug)]
pub struct NspBuild {
    /// The PFS0 image.
    pub nsp: Vec<u8>,
    pub title_id: u64,
    /// Hex NCA ids in package order (Program, Control, manuals, Meta).
    pub nca_ids: Vec<String>,
    /// `<title id hex>.nsp`
    pub filename: String,
}

impl NspBuild {
    pub fn title_id_hex(&self) -> String {
        format!("{:016x}", self.title_id)
    }
}

fn map_get_mut<'a>(map: &'a mut FileMap, name: &str) -> Option<&'a mut Vec<u8>> {
    map.iter_mut()
        .find(|(n, _)| n == name)
        .map(|(_, data)| data)
}

fn pfs0_image(map: &FileMap) -> Result<Vec<u8>> {
    let mut builder = Pfs0Builder::new();
    for (name, data) in map {
        builder.add_file(name.clone(), data.clone());
    }
    builder.build()
}

fn padded_romfs(tree: &RomFsEntry) -> Result<Vec<u8>> {
    let mut image = build_romfs(tree)?;
    image.resize(align_up(image.len() as u64, IVFC_BLOCK_SIZE) as usize, 0);
    Ok(image)
}

/// Build a complete NSP from in-memory inputs.
pub fn build_nsp(mut options: NspBuildOptions) -> Result<NspBuild> {
    let keyset = match &options.keys {
        KeyInput::Text(text) => {
            Keyset::from_text_for_generation(text, options.key_generation.saturating_sub(1))?
        }
        KeyInput::Set(keyset) => keyset.clone(),
    };

    let signer = if options.no_sign_nca_sig2 && options.no_patch_acid_key {
        None
    } else {
        Some(NcaSigner::generate()?)
    };

    // NPDM: resolve the title id and re-key the ACID.
    let npdm = map_get_mut(&mut options.exefs, "main.npdm").ok_or_else(|| Error::MissingInput {
        name: "main.npdm".to_string(),
    })?;
    let acid_modulus = if options.no_patch_acid_key {
        None
    } else {
        signer.as_ref().map(|s| s.modulus())
    };
    let title_id = patch_npdm(npdm, options.title_id, acid_modulus)?.title_id;

    // Control: NACP checks and patches.
    if !options
        .control
        .iter()
        .any(|(name, _)| name.starts_with("icon_"))
    {
        return Err(Error::MissingInput {
            name: "icon_*.dat".to_string(),
        });
    }
    {
        let nacp_data =
            map_get_mut(&mut options.control, "control.nacp").ok_or_else(|| Error::MissingInput {
                name: "control.nacp".to_string(),
            })?;
        if !options.no_patch_nacp_logo {
            nacp::patch_logo_handling(nacp_data)?;
        }
        if options.title_name.is_some() || options.title_publisher.is_some() {
            nacp::patch_titles(
                nacp_data,
                options.title_name.as_deref(),
                options.title_publisher.as_deref(),
            )?;
        }
    }

    let params = |content_type: ContentType, signed: bool| NcaParams {
        content_type,
        title_id,
        sdk_version: options.sdk_version,
        key_generation: options.key_generation,
        key_area_key: options.key_area_key,
        keyset: &keyset,
        signer: if signed { signer.as_ref() } else { None },
        plaintext: options.plaintext,
    };

    // Program NCA: ExeFS, then optional RomFS and logo sections.
    let mut program_sections: Vec<NcaSectionData> = Vec::new();
    program_sections.push(pfs0_section(
        pfs0_image(&options.exefs)?,
        EXEFS_BLOCK_SIZE,
        EncryptionType::AesCtr,
    ));
    if let Some(tree) = &options.romfs {
        program_sections.push(romfs_section(padded_romfs(tree)?)?);
    }
    if let (Some(logo), false) = (&options.logo, options.no_logo) {
        program_sections.push(pfs0_section(
            pfs0_image(logo)?,
            LOGO_BLOCK_SIZE,
            EncryptionType::None,
        ));
    }
    let program = build_nca(
        &params(ContentType::Program, !options.no_sign_nca_sig2),
        program_sections,
    )?;

    // Control NCA: the control map as a flat RomFS.
    let control_tree = RomFsEntry::from_files(
        options
            .control
            .iter()
            .map(|(name, data)| (name.clone(), data.clone())),
    );
    let control = build_nca(
        &params(ContentType::Control, false),
        vec![romfs_section(padded_romfs(&control_tree)?)?],
    )?;

    let htmldoc = options
        .htmldoc
        .as_ref()
        .map(|tree| -> Result<BuiltNca> {
            build_nca(
                &params(ContentType::Manual, false),
                vec![romfs_section(padded_romfs(tree)?)?],
            )
        })
        .transpose()?;
    let legalinfo = options
        .legalinfo
        .as_ref()
        .map(|tree| -> Result<BuiltNca> {
            build_nca(
                &params(ContentType::Manual, false),
                vec![romfs_section(padded_romfs(tree)?)?],
            )
        })
        .transpose()?;

    // CNMT over the finished content NCAs, then the Meta NCA wrapping it.
    let mut records = vec![
        ContentRecord {
            hash: program.hash,
            size: program.size(),
            content_type: PackagedContentType::Program,
        },
        ContentRecord {
            hash: control.hash,
            size: control.size(),
            content_type: PackagedContentType::Control,
        },
    ];
    if let Some(nca) = &htmldoc {
        records.push(ContentRecord {
            hash: nca.hash,
            size: nca.size(),
            content_type: PackagedContentType::HtmlDocument,
        });
    }
    if let Some(nca) = &legalinfo {
        records.push(ContentRecord {
            hash: nca.hash,
            size: nca.size(),
            content_type: PackagedContentType::LegalInformation,
        });
    }

    let cnmt = Cnmt::build_application(title_id, 0, &records)?;
    let mut meta_pfs0 = Pfs0Builder::new();
    meta_pfs0.add_file(format!("Application_{title_id:016x}.cnmt"), cnmt);
    let meta = build_nca(
        &params(ContentType::Meta, false),
        vec![pfs0_section(
            meta_pfs0.build()?,
            META_BLOCK_SIZE,
            EncryptionType::AesCtr,
        )],
    )?;

    // Package: content NCAs in order, Meta last with the .cnmt.nca name.
    let mut nsp = Pfs0Builder::new();
    let mut nca_ids = Vec::new();
    let content_ncas = [Some(&program), Some(&control), htmldoc.as_ref(), legalinfo.as_ref()];
    for nca in content_ncas.into_iter().flatten() {
        nsp.add_file(format!("{}.nca", nca.nca_id_hex()), nca.bytes.clone());
        nca_ids.push(nca.nca_id_hex());
    }
    nsp.add_file(format!("{}.cnmt.nca", meta.nca_id_hex()), meta.bytes.clone());
    nca_ids.push(meta.nca_id_hex());

    let filename = format!("{title_id:016x}.nsp");
    tracing::info!(
        title_id = format!("{title_id:016x}"),
        ncas = nca_ids.len(),
        %filename,
        "NSP built"
    );

    Ok(NspBuild {
        nsp: nsp.build()?,
        title_id,
        nca_ids,
        filename,
    })
}
