// mem_map.rs — Companion memory-map (.mem) file
//
// Declares the whole-program variables that live at fixed addresses:
// inputs the host places in memory before the program starts, outputs the
// host reads back, and metadata tables shared by every kernel. Keygen
// entries are recorded but never occupy an address.
//
// Line grammar:
//   dload, poly, <addr>, <name>          input
//   dstore, <name>, <addr>               output
//   dload, <field>, <addr>[, <name>]     metadata (default name `<field>_<addr>`)
//   keygen, <seed>, <key>, <name>        keygen
//
// Preconditions: none.
// Postconditions: every declared name maps to exactly one address.
// Failure modes: malformed line → `LinkError::Parse`; a name redeclared at
//   a different address → `LinkError::DuplicateDeclaration`.
// Side effects: `load` reads one file.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::warn;

use crate::error::{LinkError, Result};
use crate::isa::{is_valid_variable_name, Address};
use crate::lexer::tokenize_line;

// ── Data types ───────────────────────────────────────────────────────────

/// Metadata table kinds accepted after `dload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaField {
    Ones,
    NttAuxTable,
    NttRoutingTable,
    InttAuxTable,
    InttRoutingTable,
    Twiddle,
    KeygenSeed,
}

impl MetaField {
    pub const ALL: [MetaField; 7] = [
        MetaField::Ones,
        MetaField::NttAuxTable,
        MetaField::NttRoutingTable,
        MetaField::InttAuxTable,
        MetaField::InttRoutingTable,
        MetaField::Twiddle,
        MetaField::KeygenSeed,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            MetaField::Ones => "ones",
            MetaField::NttAuxTable => "ntt_auxiliary_table",
            MetaField::NttRoutingTable => "ntt_routing_table",
            MetaField::InttAuxTable => "intt_auxiliary_table",
            MetaField::InttRoutingTable => "intt_routing_table",
            MetaField::Twiddle => "twid",
            MetaField::KeygenSeed => "keygen_seed",
        }
    }

    pub fn from_keyword(word: &str) -> Option<MetaField> {
        MetaField::ALL.iter().copied().find(|f| f.keyword() == word)
    }
}

/// What a declared variable is to the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarRole {
    Input,
    Output,
    Metadata(MetaField),
}

impl VarRole {
    /// Outputs and metadata stay resident for the whole program. Inputs may
    /// be recycled once their last reader has run.
    pub fn is_persistent(self) -> bool {
        !matches!(self, VarRole::Input)
    }
}

impl fmt::Display for VarRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarRole::Input => write!(f, "input"),
            VarRole::Output => write!(f, "output"),
            VarRole::Metadata(field) => write!(f, "metadata ({})", field.keyword()),
        }
    }
}

/// One fixed-address variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub address: Address,
    pub role: VarRole,
}

/// A keygen entry. Generated on chip, so it has no memory address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeygenDecl {
    pub name: String,
    pub seed: u32,
    pub key: u32,
}

// ── Memory map ───────────────────────────────────────────────────────────

/// Declared whole-program variables, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    decls: Vec<Declaration>,
    index: HashMap<String, usize>,
    keygens: Vec<KeygenDecl>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and parse a memory-map file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| LinkError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse memory-map text. `source_name` labels diagnostics.
    pub fn parse(text: &str, source_name: &str) -> Result<Self> {
        let mut map = MemoryMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let parse_err = |message: String| LinkError::Parse {
                source_name: source_name.to_string(),
                line: line_no,
                message,
            };
            let Some(line) = tokenize_line(raw).map_err(|e| parse_err(e.to_string()))? else {
                continue;
            };
            match parse_entry(&line.fields).map_err(parse_err)? {
                Entry::Fixed(decl) => map.declare(decl)?,
                Entry::Keygen(kg) => map.keygens.push(kg),
            }
        }
        Ok(map)
    }

    /// Add a declaration. Redeclaring a name at the same address is allowed;
    /// the persistent role wins so an in-place output is never recycled.
    pub fn declare(&mut self, decl: Declaration) -> Result<()> {
        if !is_valid_variable_name(&decl.name) {
            return Err(LinkError::InvalidVariableName { name: decl.name });
        }
        if let Some(&i) = self.index.get(&decl.name) {
            let existing = &mut self.decls[i];
            if existing.address != decl.address {
                return Err(LinkError::DuplicateDeclaration {
                    name: decl.name,
                    first: existing.address,
                    second: decl.address,
                });
            }
            if decl.role.is_persistent() && !existing.role.is_persistent() {
                existing.role = decl.role;
            } else if existing.role != decl.role {
                warn!(
                    variable = %decl.name,
                    kept = %existing.role,
                    ignored = %decl.role,
                    "variable declared with two roles"
                );
            }
            return Ok(());
        }
        self.index.insert(decl.name.clone(), self.decls.len());
        self.decls.push(decl);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.index.get(name).map(|&i| &self.decls[i])
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.get(name).map(|d| d.address)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter()
    }

    pub fn keygens(&self) -> &[KeygenDecl] {
        &self.keygens
    }

    /// Name → address for every fixed-address declaration.
    pub fn fixed_addresses(&self) -> HashMap<String, Address> {
        self.decls
            .iter()
            .map(|d| (d.name.clone(), d.address))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

// ── Line parser ──────────────────────────────────────────────────────────

enum Entry {
    Fixed(Declaration),
    Keygen(KeygenDecl),
}

fn parse_address(field: &str) -> std::result::Result<Address, String> {
    field
        .parse()
        .map_err(|_| format!("expected address, found '{field}'"))
}

fn parse_entry(fields: &[String]) -> std::result::Result<Entry, String> {
    let keyword = fields.first().map(String::as_str).unwrap_or_default();
    match keyword {
        "dload" if fields.get(1).map(String::as_str) == Some("poly") => {
            if fields.len() != 4 {
                return Err("expected `dload, poly, <addr>, <name>`".to_string());
            }
            Ok(Entry::Fixed(Declaration {
                name: fields[3].clone(),
                address: parse_address(&fields[2])?,
                role: VarRole::Input,
            }))
        }
        "dload" => {
            let field_name = fields.get(1).map(String::as_str).unwrap_or_default();
            let field = MetaField::from_keyword(field_name)
                .ok_or_else(|| format!("unknown metadata field '{field_name}'"))?;
            if !(3..=4).contains(&fields.len()) {
                return Err(format!(
                    "expected `dload, {field_name}, <addr>[, <name>]`"
                ));
            }
            let address = parse_address(&fields[2])?;
            let name = match fields.get(3) {
                Some(name) if !name.is_empty() => name.clone(),
                _ => format!("{}_{address}", field.keyword()),
            };
            Ok(Entry::Fixed(Declaration {
                name,
                address,
                role: VarRole::Metadata(field),
            }))
        }
        "dstore" => {
            if fields.len() != 3 {
                return Err("expected `dstore, <name>, <addr>`".to_string());
            }
            Ok(Entry::Fixed(Declaration {
                name: fields[1].clone(),
                address: parse_address(&fields[2])?,
                role: VarRole::Output,
            }))
        }
        "keygen" => {
            if fields.len() != 4 {
                return Err("expected `keygen, <seed>, <key>, <name>`".to_string());
            }
            let seed = fields[1]
                .parse()
                .map_err(|_| format!("expected seed index, found '{}'", fields[1]))?;
            let key = fields[2]
                .parse()
                .map_err(|_| format!("expected key index, found '{}'", fields[2]))?;
            Ok(Entry::Keygen(KeygenDecl {
                name: fields[3].clone(),
                seed,
                key,
            }))
        }
        other => Err(format!("unknown memory-map keyword '{other}'")),
    }
}
