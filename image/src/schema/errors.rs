use crate::raw::indices::metadata_token::MetadataToken;

#[derive(Debug)]
pub enum ReadError {
	IoError(std::io::Error),
	MissingMetadataHeap(&'static str),
	MissingMetadataTable(&'static str),

	InvalidStringToken(MetadataToken),
	InvalidMethodRVA(u32),
	InvalidMethodCode(MetadataToken, std::io::Error),
	InvalidTypeSignature,

	#[cfg(feature = "memmap2")]
	MemMapError(memmap2::Error),
}

impl From<std::io::Error> for ReadError {
	fn from(value: std::io::Error) -> Self {
		Self::IoError(value)
	}
}

#[cfg(feature = "memmap2")]
impl From<memmap2::Error> for ReadError {
	fn from(value: memmap2::Error) -> Self {
		Self::MemMapError(value)
	}
}

impl std::fmt::Display for ReadError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::IoError(err) => write!(f, "I/O error: {err}"),
			Self::MissingMetadataHeap(name) => write!(f, "missing metadata heap {name:?}"),
			Self::MissingMetadataTable(name) => write!(f, "missing metadata table {name:?}"),
			Self::InvalidStringToken(token) => write!(f, "invalid string token {token:?}"),
			Self::InvalidMethodRVA(rva) => write!(f, "method RVA {rva:#X} does not resolve to a section"),
			Self::InvalidMethodCode(token, err) => write!(f, "invalid method body for {token:?}: {err}"),
			Self::InvalidTypeSignature => write!(f, "invalid type signature"),
			#[cfg(feature = "memmap2")]
			Self::MemMapError(err) => write!(f, "memory-mapping error: {err}"),
		}
	}
}

impl std::error::Error for ReadError {}


