/// Data layer: run folder files and the in-memory frame types.
///
/// Architecture:
/// ```text
///  *.par        deformation_LL_{0,1}.dat[.bz2]     images/*.tiff   spectra/*.parquet
///    │                     │                            │               │
///    ▼                     ▼                            └──────┬────────┘
///  ┌────────┐        ┌─────────────┐                           ▼
///  │ config  │        │ deformation  │  P8/P9 codec        ┌──────────┐
///  └────────┘        └─────────────┘                      │  loader   │
///    │                     │                              └──────────┘
///    ▼                     ▼                                   │
///  ConfigRecord      DeformationField (dX, dY)                 ▼
///                                                  ImageFrame / SpectralFrame (model)
/// ```

pub mod config;
pub mod deformation;
pub mod loader;
pub mod model;
