//! 프로필 이름 조회 모듈
//!
//! 공개 프로필 XML에서 소유자 표시 이름을 가져옵니다.
//! 조회한 이름은 키-값 저장소에 캐시하며, 강제 새로고침 시에만 다시 조회합니다.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::HostError;
use crate::host::OwnerNameSource;
use crate::input_validation::normalize_override;
use crate::store::KeyValueStore;
use crate::sync_engine::types::OwnerId;

/// 프로필 XML URL (`{id}` 치환)
pub const PROFILE_XML_URL: &str = "https://steamcommunity.com/profiles/{id}/?xml=1";

/// 요청 타임아웃
const REQUEST_TIMEOUT: Duration = Duration::from_secs(6);

const PROFILE_NAME_TAG: &[u8] = b"steamID";

const USER_AGENT: &str = concat!("shelfsync/", env!("CARGO_PKG_VERSION"));

/// 원격 프로필 기반 소유자 이름 서비스
pub struct ProfileNameService {
    client: reqwest::Client,
    storage: Arc<dyn KeyValueStore>,
    cache_key: String,
    url_template: String,
}

impl ProfileNameService {
    pub fn new(storage: Arc<dyn KeyValueStore>, cache_key: impl Into<String>) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HostError::Remote(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            storage,
            cache_key: cache_key.into(),
            url_template: PROFILE_XML_URL.to_string(),
        })
    }

    /// 테스트나 미러 서버용 URL 템플릿 지정
    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }

    /// 저장된 이름 캐시를 로드합니다. 형식이 잘못된 경우 빈 캐시를 반환합니다.
    async fn load_cache(&self) -> BTreeMap<OwnerId, String> {
        let raw = match self.storage.get(&self.cache_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return BTreeMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read owner name cache");
                return BTreeMap::new();
            }
        };
        normalize_name_cache(&raw)
    }

    async fn save_cache(&self, cache: &BTreeMap<OwnerId, String>) {
        let json = match serde_json::to_string(cache) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode owner name cache");
                return;
            }
        };
        if let Err(e) = self.storage.set(&self.cache_key, &json).await {
            tracing::warn!(error = %e, "failed to persist owner name cache");
        }
    }

    /// 프로필 XML을 가져와 이름을 추출합니다. 실패 시 None.
    async fn fetch_profile_name(&self, owner_id: &str) -> Option<String> {
        let url = self.url_template.replace("{id}", owner_id);
        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(owner_id, error = %e, "profile request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(owner_id, status = %response.status(), "profile request rejected");
            return None;
        }
        let body = response.text().await.ok()?;
        extract_profile_name(&body)
    }
}

#[async_trait]
impl OwnerNameSource for ProfileNameService {
    async fn resolve_names(
        &self,
        owner_ids: &[OwnerId],
        force_refresh: bool,
    ) -> Result<BTreeMap<OwnerId, String>, HostError> {
        let ids = dedup_owner_ids(owner_ids.iter().map(String::as_str));
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut cache = self.load_cache().await;
        let mut result = BTreeMap::new();
        let mut cache_updated = false;

        for id in ids {
            if !force_refresh {
                if let Some(cached) = cache.get(&id) {
                    result.insert(id, cached.clone());
                    continue;
                }
            }

            if let Some(name) = self.fetch_profile_name(&id).await {
                cache.insert(id.clone(), name.clone());
                result.insert(id, name);
                cache_updated = true;
            }
        }

        if cache_updated {
            self.save_cache(&cache).await;
        }
        Ok(result)
    }
}

/// 쉼표로 구분된 ID 문자열을 파싱합니다 (공백 제거, 중복 제거, 순서 유지).
pub fn parse_owner_ids(csv: &str) -> Vec<OwnerId> {
    dedup_owner_ids(csv.split(','))
}

fn dedup_owner_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<OwnerId> {
    let mut seen = HashSet::new();
    ids.map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

/// 저장된 캐시 JSON을 정규화합니다. 문자열이 아닌 값과 빈 값은 버립니다.
pub fn normalize_name_cache(raw: &str) -> BTreeMap<OwnerId, String> {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(raw) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(id, name)| {
            let id = id.trim().to_string();
            let name = normalize_override(name.as_str()?)?;
            (!id.is_empty()).then_some((id, name))
        })
        .collect()
}

/// `<steamID>` 요소의 텍스트를 추출합니다 (CDATA, 문자 참조 허용).
pub fn extract_profile_name(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut inside = false;
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == PROFILE_NAME_TAG => inside = true,
            Ok(Event::Text(t)) if inside => text.push_str(&t.unescape().ok()?),
            Ok(Event::CData(c)) if inside => text.push_str(&String::from_utf8_lossy(&c)),
            Ok(Event::End(e)) if inside && e.name().as_ref() == PROFILE_NAME_TAG => {
                return normalize_override(&text);
            }
            Ok(Event::Eof) => return None,
            Err(e) => {
                tracing::debug!(error = %e, "profile response is not well-formed XML");
                return None;
            }
            Ok(_) => {}
        }
    }
}
