//! 에러 코드 상수 정의
//!
//! 설정 화면에서 i18n 처리를 위해 에러 코드를 문자열로 반환합니다.

/// Owner ID가 비어 있음
pub const ERR_OWNER_ID_REQUIRED: &str = "ERR_OWNER_ID_REQUIRED";

/// 설정 저장 실패
pub const ERR_PERSIST_FAILED: &str = "ERR_PERSIST_FAILED";

/// 이미 동기화가 진행 중
pub const ERR_SYNC_BUSY: &str = "ERR_SYNC_BUSY";

/// 동기화 실패
pub const ERR_SYNC_FAILED: &str = "ERR_SYNC_FAILED";
