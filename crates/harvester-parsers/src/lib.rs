pub mod flathub;
pub mod nix;
pub mod pkgbuild;

pub use nix::{NixDependencies, ParseQuality, parse_nix_dependencies};
pub use pkgbuild::{PkgBuild, parse_pkgbuild};
