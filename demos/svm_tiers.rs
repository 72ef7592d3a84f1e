use std::sync::Arc;

use clmem::device::{ClVersion, DeviceCaps, SoftwareDevice, SvmCapabilities};
use clmem::diag::TracingSink;
use clmem::memory::{AccessMode, MemoryRegion, RegionConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("            clmem - Shared Memory Tier Walkthrough          ");
    println!("============================================================");

    let device = Arc::new(SoftwareDevice::new());

    // Capability words as a device might report them.
    let reported = [
        ("no SVM", SvmCapabilities::from_raw(0)),
        (
            "coarse-grain buffer",
            SvmCapabilities::from_raw(SvmCapabilities::COARSE_GRAIN_BUFFER),
        ),
        (
            "fine-grain buffer",
            SvmCapabilities::from_raw(
                SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::FINE_GRAIN_BUFFER,
            ),
        ),
    ];

    for (label, svm) in reported {
        let tier = svm.best_tier();
        println!("[+] Device reporting {label}: best tier is '{}'", tier.name());

        let caps = DeviceCaps::new(ClVersion::new(2, 0), svm);
        let region = MemoryRegion::allocate(
            device.clone(),
            caps,
            Arc::new(TracingSink),
            RegionConfig {
                size_bytes: 1024,
                access: AccessMode::ReadWrite,
                tier,
            },
        )?;

        println!(
            "    Allocated {} bytes, tier '{}', mapped on allocation: {}",
            region.size_bytes(),
            region.tier_name(),
            region.is_host_mapped()
        );

        region.write_from(&[0x42; 1024])?;
        let mut out = vec![0u8; 1024];
        region.read_into(&mut out)?;
        println!(
            "    Host write/read through tier '{}' ok: {}",
            region.tier_name(),
            out.iter().all(|&b| b == 0x42)
        );
    }

    Ok(())
}
