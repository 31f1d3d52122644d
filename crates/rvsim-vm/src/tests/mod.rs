mod helpers;

mod pmp;
mod props;
