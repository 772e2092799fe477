//! Architecture-specific glue. Only x86-64 is implemented; the core's
//! invariants (canonical 48-bit addressing, 4-level paging, LAPIC/IO-APIC
//! interrupt routing) are x86-64 specific by spec, so there is no
//! architecture-neutral trait layer here.

pub mod x86_64;
