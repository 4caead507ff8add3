use memflow::prelude::v1::*;

use goblin::elf::sym::{STT_FILE, STT_SECTION};
use goblin::elf::Elf;

use log::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub address: Address,
    /// Known for ELF symbols, absent for `System.map` entries.
    pub size: Option<usize>,
    pub name: String,
}

/// Kernel symbols sorted by address.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    syms: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: Address, name: &str, size: Option<usize>) {
        let idx = self.syms.partition_point(|s| s.address <= address);
        self.syms.insert(
            idx,
            Symbol {
                address,
                size,
                name: name.to_string(),
            },
        );
    }

    pub fn with_symbol(mut self, address: Address, name: &str) -> Self {
        self.insert(address, name, None);
        self
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Loads the symbol table of a `vmlinux` image.
    pub fn from_elf(bytes: &[u8]) -> Result<Self> {
        let elf = Elf::parse(bytes).map_err(|e| {
            warn!("unable to parse vmlinux: {}", e);
            Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArgument)
        })?;

        let mut syms = elf
            .syms
            .iter()
            .filter(|sym| sym.st_value != 0)
            .filter(|sym| !matches!(sym.st_type(), STT_FILE | STT_SECTION))
            .filter_map(|sym| {
                let name = elf.strtab.get_at(sym.st_name)?;
                if name.is_empty() {
                    return None;
                }
                Some(Symbol {
                    address: Address::from(sym.st_value),
                    size: Some(sym.st_size as usize).filter(|&s| s != 0),
                    name: name.to_string(),
                })
            })
            .collect::<Vec<_>>();

        syms.sort_by_key(|s| s.address);

        info!("loaded {} symbols from vmlinux", syms.len());

        Ok(Self { syms })
    }

    /// Parses `System.map` (`nm` output): `<hex address> <type> <name>`.
    ///
    /// Undefined and absolute entries are skipped.
    pub fn from_system_map(text: &str) -> Result<Self> {
        let mut syms = vec![];

        for (lineno, line) in text.lines().enumerate() {
            let mut words = line.split_whitespace();
            let (addr, ty, name) = match (words.next(), words.next(), words.next()) {
                (None, _, _) => continue,
                // Undefined entries carry no address column.
                (Some(ty), Some(_), None) if ty.len() == 1 => continue,
                (Some(addr), Some(ty), Some(name)) => (addr, ty, name),
                _ => {
                    warn!("malformed System.map line {}: {}", lineno + 1, line);
                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArgument));
                }
            };

            if matches!(ty, "U" | "a" | "A" | "w" | "v") {
                continue;
            }

            let address = u64::from_str_radix(addr, 16).map_err(|_| {
                warn!("bad address on System.map line {}: {}", lineno + 1, addr);
                Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArgument)
            })?;

            syms.push(Symbol {
                address: Address::from(address),
                size: None,
                name: name.to_string(),
            });
        }

        syms.sort_by_key(|s| s.address);

        info!("loaded {} symbols from System.map", syms.len());

        Ok(Self { syms })
    }

    /// Finds the symbol containing `addr`, returning its name and the offset into it.
    pub fn lookup(&self, addr: Address) -> Option<(&str, usize)> {
        let idx = self.syms.partition_point(|s| s.address <= addr);
        let sym = self.syms.get(idx.checked_sub(1)?)?;
        let offset = (addr.to_umem() - sym.address.to_umem()) as usize;

        match sym.size {
            Some(size) if offset >= size => None,
            _ => Some((sym.name.as_str(), offset)),
        }
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.syms.iter().find(|s| s.name == name).map(|s| s.address)
    }
}
