//! Embedded ELF symbol table lookup, used by [`super::panic::report`] to
//! name the frames [`super::backtrace::walk`] finds (spec §4.5, §8 scenario
//! 6: "at least 2 stack frames naming symbols resolvable via the embedded
//! symbol table").
//!
//! The symbol and string tables are two ordinary sections of the kernel's
//! own ELF image (`.symtab`/`.strtab`), located through Multiboot2's ELF
//! sections tag — the same tag [`super::kernel_image_bounds`] already reads
//! to find where the loaded image starts and ends. Nothing is copied out of
//! them; [`resolve`] parses the raw section bytes in place on every call.

use elf::endian::LittleEndian;
use elf::string_table::StringTable;
use elf::symbol::SymbolTable;
use hermit_sync::OnceCell;

struct Tables {
	symtab_addr: u64,
	symtab_size: u64,
	strtab_addr: u64,
	strtab_size: u64,
}

static TABLES: OnceCell<Tables> = OnceCell::new();

/// Records the `.symtab`/`.strtab` sections out of `boot_info`'s ELF
/// sections tag, if the image was not stripped of them. Called once, from
/// [`super::boot_processor_init`]; a second call is a no-op.
pub fn init(boot_info: &multiboot2::BootInformation<'_>) {
	let Some(tag) = boot_info.elf_sections_tag() else {
		return;
	};

	let mut symtab = None;
	let mut strtab = None;
	for section in tag.sections() {
		match section.name().unwrap_or_default() {
			".symtab" => symtab = Some((section.start_address(), section.size())),
			".strtab" => strtab = Some((section.start_address(), section.size())),
			_ => {}
		}
	}

	let (Some((symtab_addr, symtab_size)), Some((strtab_addr, strtab_size))) = (symtab, strtab) else {
		log::warn!("no .symtab/.strtab in the boot image; panics will not name symbols");
		return;
	};

	let _ = TABLES.set(Tables {
		symtab_addr,
		symtab_size,
		strtab_addr,
		strtab_size,
	});
}

/// Finds the `STT_FUNC` symbol containing `addr`, returning its name and
/// `addr`'s offset within it. `None` if [`init`] never found a symbol table,
/// or `addr` falls in a range no symbol covers (common for addresses inside
/// hand-written assembly stubs, which carry no symbol table entry).
pub fn resolve(addr: u64) -> Option<(&'static str, u64)> {
	let tables = TABLES.get()?;

	// SAFETY: these sections are part of the kernel's own loaded image,
	// mapped read-only for the lifetime of the kernel.
	let symtab_bytes =
		unsafe { core::slice::from_raw_parts(tables.symtab_addr as *const u8, tables.symtab_size as usize) };
	let strtab_bytes =
		unsafe { core::slice::from_raw_parts(tables.strtab_addr as *const u8, tables.strtab_size as usize) };

	let symtab = SymbolTable::<LittleEndian>::new(LittleEndian, symtab_bytes);
	let strtab = StringTable::new(strtab_bytes);

	symtab
		.iter()
		.filter(|sym| sym.st_value != 0 && sym.st_size != 0 && addr >= sym.st_value && addr < sym.st_value + sym.st_size)
		.find_map(|sym| {
			let name = strtab.get(sym.st_name as usize).ok()?;
			Some((name, addr - sym.st_value))
		})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_without_init_returns_none() {
		assert!(resolve(0x1234).is_none());
	}
}
